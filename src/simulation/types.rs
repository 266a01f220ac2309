//! Scene description, validation, and the channel types shared by the
//! simulation tasks.
//!
//! A scene is a JSON file listing the nodes (address, position, transmit
//! power, clock imperfections), the sink, the report order and the radio
//! channel. The protocol timing lives in a separate `config.toml` (see
//! [`crate::scheduler::ProtocolConfig`]).

use anyhow::Context;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

use crate::flood::FastTicks;
use crate::scheduler::{MacConfiguration, RoundSummary};

use super::signal_calculations::PathLossParameters;

/// Power margin (dB) by which a locked frame must exceed an overlapping,
/// non-identical frame to survive it.
pub const CAPTURE_THRESHOLD: f32 = 3.0;

/// Constructive interference holds only if overlapping identical frames start
/// within this many fast ticks (~0.5 µs) of each other.
pub const CONSTRUCTIVE_WINDOW_TICKS: FastTicks = 2;

/// Capacity of the queue carrying network events to the report task.
pub const REPORT_QUEUE_SIZE: usize = 64;

pub type ReportQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReportMessage, REPORT_QUEUE_SIZE>;

pub type ReportQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReportMessage, REPORT_QUEUE_SIZE>;

pub type ReportQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReportMessage, REPORT_QUEUE_SIZE>;

/// Signalled once by the report task when the run is over.
pub type CompletionSignal = embassy_sync::signal::Signal<CriticalSectionRawMutex, SimulationOutcome>;

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneError {
    FileRead(String),
    Parse(String),
    Validation(String),
}

impl std::fmt::Display for SceneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneError::FileRead(msg) => write!(f, "Failed to read file: {}", msg),
            SceneError::Parse(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneError {}

/// Simple 2D point in meters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Transceiver and interrupt controller behaviour shared by every node.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RadioParameters {
    /// Weakest frame the receiver locks onto (dBm).
    pub sensitivity_dbm: f32,
    pub capture_threshold_db: f32,
    pub constructive_window_ticks: FastTicks,
    /// Fixed part of the SFD edge to handler latency (fast ticks).
    pub irq_latency_base: FastTicks,
    /// Uniform random extra latency, `0..=irq_latency_jitter` fast ticks.
    pub irq_latency_jitter: FastTicks,
    /// Probability that a clean reception still fails its CRC.
    pub corruption_probability: f64,
}

impl Default for RadioParameters {
    fn default() -> Self {
        Self {
            sensitivity_dbm: -95.0,
            capture_threshold_db: CAPTURE_THRESHOLD,
            constructive_window_ticks: CONSTRUCTIVE_WINDOW_TICKS,
            irq_latency_base: 2,
            irq_latency_jitter: 4,
            corruption_probability: 0.0,
        }
    }
}

/// One simulated node.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NodeSpec {
    pub address: u8,
    pub position: Point,
    /// Transmit power in dBm.
    #[serde(default)]
    pub tx_power: f32,
    /// Crystal error; positive runs fast.
    #[serde(default)]
    pub drift_ppm: f64,
    /// Local fast-clock value at simulation start.
    #[serde(default)]
    pub boot_offset: FastTicks,
    /// Parent in the collection tree, reported to the sink. 0 for none.
    #[serde(default)]
    pub parent: u8,
    /// Packet rate reported to the sink.
    #[serde(default)]
    pub data_rate: u16,
}

/// Configuration the sink starts disseminating once `round` rounds are complete.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ConfigUpdate {
    pub round: u32,
    #[serde(flatten)]
    pub config: MacConfiguration,
}

fn default_rounds() -> u32 {
    5
}

fn default_speed_percent() -> u32 {
    100
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize, Clone)]
pub struct Scene {
    pub path_loss_parameters: PathLossParameters,
    #[serde(default)]
    pub radio: RadioParameters,
    pub nodes: Vec<NodeSpec>,
    /// Address of the sink node.
    pub sink: u8,
    /// Report order. Defaults to every node except the sink, in scene order.
    #[serde(default)]
    pub address_table: Option<Vec<u8>>,
    /// Configuration the sink disseminates from the first round on.
    #[serde(default)]
    pub mac_config: MacConfiguration,
    #[serde(default)]
    pub config_updates: Vec<ConfigUpdate>,
    /// Seed for shadowing, latency jitter and random corruption.
    #[serde(default)]
    pub seed: u64,
    /// Sink rounds to simulate before stopping.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_speed_percent")]
    pub speed_percent: u32,
}

impl Scene {
    /// Report phase order for this scene.
    pub fn report_order(&self) -> Vec<u8> {
        match &self.address_table {
            Some(table) => table.clone(),
            None => self
                .nodes
                .iter()
                .map(|n| n.address)
                .filter(|&a| a != self.sink)
                .collect(),
        }
    }
}

/// Messages from the network task to the report task.
#[derive(Debug, Clone)]
pub enum ReportMessage {
    ConfigurationChanged { address: u8, config: MacConfiguration },
    RoundCompleted(RoundSummary),
    Finished(SimulationOutcome),
}

/// Events collected by the network while it advances.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ConfigurationChanged { address: u8, config: MacConfiguration },
    RoundCompleted(RoundSummary),
}

/// Medium-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediumStats {
    pub transmissions: u64,
    pub receptions: u64,
    pub corrupted_receptions: u64,
    /// Identical frames merged into an ongoing reception.
    pub constructive: u64,
    /// Overlapping frames suppressed by a stronger locked frame.
    pub captured: u64,
    pub collisions: u64,
}

/// Final result of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationOutcome {
    pub rounds: u32,
    pub virtual_time: FastTicks,
    pub stats: MediumStats,
    /// Relays that left bootstrap during the run.
    pub synced_relays: usize,
    pub relays: usize,
}

/// Load and parse a scene from a file.
pub fn load_scene(path: &str) -> Result<Scene, SceneError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneError::FileRead(e.to_string()))?;

    let scene: Scene = serde_json::from_str(&data)
        .context("Invalid JSON format")
        .map_err(|e| SceneError::Parse(e.to_string()))?;

    validate_scene(&scene).map_err(SceneError::Validation)?;

    Ok(scene)
}

/// Validate a parsed scene.
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_NODES: usize = 254;
    const MAX_WORLD_COORD: f64 = 100_000.0;
    const MIN_TX_POWER: f32 = -50.0;
    const MAX_TX_POWER: f32 = 30.0;
    const MAX_DRIFT_PPM: f64 = 500.0;

    if scene.nodes.is_empty() {
        return Err("Scene must contain at least one node".to_string());
    }
    if scene.nodes.len() > MAX_NODES {
        return Err(format!("Node count {} exceeds maximum of {}", scene.nodes.len(), MAX_NODES));
    }

    let mut addresses = HashSet::new();
    for node in &scene.nodes {
        if node.address == 0 {
            return Err("Address 0 is reserved for \"no parent\"".to_string());
        }
        if !addresses.insert(node.address) {
            return Err(format!("Duplicate node address found: {}", node.address));
        }
    }

    for node in &scene.nodes {
        if node.position.x.abs() > MAX_WORLD_COORD || node.position.y.abs() > MAX_WORLD_COORD {
            return Err(format!(
                "Node {} position ({}, {}) exceeds world bounds (±{})",
                node.address, node.position.x, node.position.y, MAX_WORLD_COORD
            ));
        }
        if node.tx_power < MIN_TX_POWER || node.tx_power > MAX_TX_POWER {
            return Err(format!(
                "Node {} tx_power {} dBm outside realistic range ({} to {} dBm)",
                node.address, node.tx_power, MIN_TX_POWER, MAX_TX_POWER
            ));
        }
        if !node.drift_ppm.is_finite() || node.drift_ppm.abs() > MAX_DRIFT_PPM {
            return Err(format!(
                "Node {} drift_ppm {} outside ±{}",
                node.address, node.drift_ppm, MAX_DRIFT_PPM
            ));
        }
        if node.parent != 0 && !addresses.contains(&node.parent) {
            return Err(format!("Node {} has unknown parent {}", node.address, node.parent));
        }
    }

    if !addresses.contains(&scene.sink) {
        return Err(format!("Sink {} is not a node of the scene", scene.sink));
    }

    let mut seen = HashSet::new();
    for address in scene.report_order() {
        if address == scene.sink {
            return Err(format!("address_table must not contain the sink {}", address));
        }
        if !addresses.contains(&address) {
            return Err(format!("address_table entry {} is not a node of the scene", address));
        }
        if !seen.insert(address) {
            return Err(format!("address_table lists node {} twice", address));
        }
    }

    let path_loss = &scene.path_loss_parameters;
    if path_loss.path_loss_exponent <= 0.0 {
        return Err("Invalid path_loss_exponent, must be positive".to_string());
    }
    if path_loss.shadowing_sigma < 0.0 {
        return Err("Invalid shadowing_sigma, must be non-negative".to_string());
    }

    let radio = &scene.radio;
    if !(0.0..=1.0).contains(&radio.corruption_probability) {
        return Err(format!(
            "Invalid corruption_probability {}, must be within 0-1",
            radio.corruption_probability
        ));
    }
    if radio.capture_threshold_db < 0.0 {
        return Err("Invalid capture_threshold_db, must be non-negative".to_string());
    }

    for config in std::iter::once(&scene.mac_config).chain(scene.config_updates.iter().map(|u| &u.config)) {
        if config.n == 0 || config.n > crate::flood::engine::MAX_RETRANSMISSIONS {
            return Err(format!("MAC configuration n={} must be in 1..=16", config.n));
        }
    }
    if scene.config_updates.len() > u8::MAX as usize {
        return Err("Too many config_updates, sequence numbers are one byte".to_string());
    }

    if scene.rounds == 0 {
        return Err("rounds must be positive".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "path_loss_parameters": {
            "path_loss_exponent": 3.0,
            "shadowing_sigma": 0.0,
            "path_loss_at_reference_distance": 40.0
        },
        "nodes": [
            { "address": 1, "position": { "x": 0, "y": 0 } },
            { "address": 7, "position": { "x": 20, "y": 0 }, "parent": 1, "data_rate": 4 },
            { "address": 3, "position": { "x": 40, "y": 0 }, "parent": 7, "drift_ppm": 25.5 }
        ],
        "sink": 1,
        "mac_config": { "t_l": 328, "t_s": 3277, "n": 3 },
        "config_updates": [ { "round": 2, "t_l": 500, "t_s": 5000, "n": 2 } ]
    }"#;

    fn minimal() -> Scene {
        serde_json::from_str(MINIMAL).expect("scene")
    }

    #[test]
    fn defaults_are_filled_in() {
        let scene = minimal();
        assert_eq!(scene.rounds, 5);
        assert_eq!(scene.speed_percent, 100);
        assert_eq!(scene.radio, RadioParameters::default());
        assert_eq!(scene.report_order(), vec![7, 3]);
        assert_eq!(scene.config_updates[0].config.t_s, 5000);
        assert_eq!(scene.nodes[2].drift_ppm, 25.5);
        assert!(validate_scene(&scene).is_ok());
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let mut scene = minimal();
        scene.nodes[2].address = 7;
        let err = validate_scene(&scene).unwrap_err();
        assert!(err.contains("Duplicate"), "{err}");
    }

    #[test]
    fn address_table_must_reference_nodes() {
        let mut scene = minimal();
        scene.address_table = Some(vec![7, 9]);
        assert!(validate_scene(&scene).is_err());
        scene.address_table = Some(vec![1, 7]);
        assert!(validate_scene(&scene).is_err());
        scene.address_table = Some(vec![3, 7]);
        assert!(validate_scene(&scene).is_ok());
    }

    #[test]
    fn missing_sink_is_rejected() {
        let mut scene = minimal();
        scene.sink = 42;
        assert!(validate_scene(&scene).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        match load_scene("does/not/exist.json") {
            Err(SceneError::FileRead(msg)) => assert!(msg.contains("does/not/exist.json")),
            other => panic!("unexpected result: {:?}", other.map(|s| s.sink)),
        }
    }
}
