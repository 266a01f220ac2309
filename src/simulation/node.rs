//! One simulated node: its drifting clock, the transceiver and timer model
//! the flood engine runs on, and the collaborators the scheduler reports to.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::flood::{FastAlarm, FastTicks, FastTimer, FloodConfig, FloodEngine, InterruptMask, Radio, SlowTicks};
use crate::scheduler::{MacConfiguration, NodeReport, ReportPhase, RoundHooks, RoundScheduler, RoundSummary, SchedulerConfig};

use super::signal_calculations::tx_start_delay;
use super::types::{NetworkEvent, NodeSpec};

/// Maps simulation (global) time onto a node's local fast clock.
///
/// `local = boot_offset + global * (1 + drift_ppm / 1e6)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeClock {
    drift_ppm: f64,
    boot_offset: FastTicks,
}

impl NodeClock {
    pub fn new(drift_ppm: f64, boot_offset: FastTicks) -> Self {
        Self { drift_ppm, boot_offset }
    }

    fn rate(&self) -> f64 {
        1.0 + self.drift_ppm * 1e-6
    }

    pub fn local(&self, global: FastTicks) -> FastTicks {
        self.boot_offset + (global as f64 * self.rate()).floor() as FastTicks
    }

    /// Earliest global time at which the local clock reads at least `local`.
    pub fn to_global(&self, local: FastTicks) -> FastTicks {
        if local <= self.boot_offset {
            return 0;
        }
        let mut global = ((local - self.boot_offset) as f64 / self.rate()).ceil() as FastTicks;
        while global > 0 && self.local(global - 1) >= local {
            global -= 1;
        }
        while self.local(global) < local {
            global += 1;
        }
        global
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Off,
    Rx,
    /// Transmit strobed, SFD not yet sent.
    TxPending { id: u64 },
    Tx { id: u64 },
}

/// Frame the receiver is locked onto.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    pub id: u64,
    /// Transmissions merged into this reception.
    pub sources: Vec<u64>,
    pub start: FastTicks,
    pub end: FastTicks,
    /// Length byte onward, without the FCS.
    pub bytes: Vec<u8>,
    pub power_mw: f64,
    /// Bytes already pushed into the RX FIFO.
    pub delivered: usize,
    pub corrupted: bool,
    /// The FIFO was flushed while the frame was still arriving.
    pub flushed: bool,
}

/// Side effects of a handler the network has to turn into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareRequest {
    /// Start of frame at global time `at`.
    Transmit { id: u64, at: FastTicks },
    Alarm { alarm: FastAlarm, at: FastTicks, generation: u64 },
    /// A transmission on air was cut short.
    Abort { id: u64 },
}

/// Transceiver with FIFOs plus the fast timer and its capture unit.
///
/// The network sets the current time with [`SimHardware::prepare`] before
/// every handler invocation and collects the resulting requests afterwards.
#[derive(Debug)]
pub struct SimHardware {
    index: usize,
    clock: NodeClock,
    clock_ratio: u64,
    global_now: FastTicks,
    local_now: FastTicks,
    mode: RadioMode,
    /// Bumped whenever the radio leaves receive mode; edges raised before
    /// that are stale.
    epoch: u64,
    rx_fifo: VecDeque<u8>,
    tx_fifo: Vec<u8>,
    reception: Option<Reception>,
    alarms: [Option<FastTicks>; 2],
    alarm_generation: [u64; 2],
    /// Global time the fast path's delay compensation aligns the next
    /// transmission to.
    tx_anchor: Option<FastTicks>,
    next_tx: u64,
    requests: Vec<HardwareRequest>,
}

impl SimHardware {
    pub fn new(index: usize, clock: NodeClock, clock_ratio: u64) -> Self {
        Self {
            index,
            clock,
            clock_ratio: clock_ratio.max(1),
            global_now: 0,
            local_now: clock.local(0),
            mode: RadioMode::Off,
            epoch: 0,
            rx_fifo: VecDeque::new(),
            tx_fifo: Vec::new(),
            reception: None,
            alarms: [None; 2],
            alarm_generation: [0; 2],
            tx_anchor: None,
            next_tx: 0,
            requests: Vec::new(),
        }
    }

    pub fn clock(&self) -> NodeClock {
        self.clock
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn local_slow_now(&self) -> SlowTicks {
        self.local_now / self.clock_ratio
    }

    pub fn slow_to_global(&self, slow: SlowTicks) -> FastTicks {
        self.clock.to_global(slow * self.clock_ratio)
    }

    pub(crate) fn prepare(&mut self, global_now: FastTicks) {
        self.global_now = global_now;
        self.local_now = self.clock.local(global_now);
    }

    pub(crate) fn set_tx_anchor(&mut self, anchor: Option<FastTicks>) {
        self.tx_anchor = anchor;
    }

    pub(crate) fn take_requests(&mut self) -> Vec<HardwareRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn reception(&self) -> Option<&Reception> {
        self.reception.as_ref()
    }

    pub(crate) fn reception_mut(&mut self) -> Option<&mut Reception> {
        self.reception.as_mut()
    }

    pub(crate) fn lock(&mut self, reception: Reception) {
        self.reception = Some(reception);
    }

    pub(crate) fn take_reception(&mut self, id: u64) -> Option<Reception> {
        match &self.reception {
            Some(r) if r.id == id => self.reception.take(),
            _ => None,
        }
    }

    pub(crate) fn deliver(&mut self, bytes: &[u8]) {
        self.rx_fifo.extend(bytes.iter().copied());
    }

    /// SFD of transmission `id` goes out now. Returns the frame, or `None`
    /// if the transmission was cancelled or the FIFO is empty.
    pub(crate) fn start_transmission(&mut self, id: u64) -> Option<Vec<u8>> {
        if self.mode != (RadioMode::TxPending { id }) {
            return None;
        }
        if self.tx_fifo.is_empty() {
            log::warn!("node #{} strobed TX with an empty FIFO", self.index);
            self.mode = RadioMode::Rx;
            return None;
        }
        self.mode = RadioMode::Tx { id };
        Some(self.tx_fifo.clone())
    }

    /// Returns true if `id` was still on air and the radio went back to RX.
    pub(crate) fn finish_transmission(&mut self, id: u64) -> bool {
        if self.mode == (RadioMode::Tx { id }) {
            self.mode = RadioMode::Rx;
            true
        } else {
            false
        }
    }

    /// Consume a fired alarm; false if it was cleared or re-armed since.
    pub(crate) fn alarm_due(&mut self, alarm: FastAlarm, generation: u64) -> bool {
        let i = alarm.index();
        if self.alarm_generation[i] != generation {
            return false;
        }
        self.alarms[i].take().is_some()
    }

    fn abort_transmission(&mut self) {
        if let RadioMode::Tx { id } = self.mode {
            self.requests.push(HardwareRequest::Abort { id });
        }
    }

    fn leave_rx(&mut self) {
        self.reception = None;
        self.epoch += 1;
    }
}

impl Radio for SimHardware {
    fn flush_rx(&mut self) {
        self.rx_fifo.clear();
        if let Some(reception) = self.reception.as_mut() {
            reception.flushed = true;
        }
    }

    fn flush_tx(&mut self) {
        self.tx_fifo.clear();
    }

    fn power_on(&mut self) {
        match self.mode {
            RadioMode::Rx => {}
            RadioMode::Off | RadioMode::TxPending { .. } => {
                self.mode = RadioMode::Rx;
                self.epoch += 1;
            }
            RadioMode::Tx { .. } => {
                self.abort_transmission();
                self.mode = RadioMode::Rx;
                self.epoch += 1;
            }
        }
    }

    fn power_off(&mut self) {
        self.abort_transmission();
        self.mode = RadioMode::Off;
        self.rx_fifo.clear();
        self.leave_rx();
    }

    fn begin_transmit(&mut self) {
        if let RadioMode::Tx { .. } = self.mode {
            log::trace!("node #{} TX strobe ignored while on air", self.index);
            return;
        }
        let id = ((self.index as u64) << 40) | self.next_tx;
        self.next_tx += 1;
        let at = self.tx_anchor.unwrap_or(self.global_now).max(self.global_now) + tx_start_delay();
        self.mode = RadioMode::TxPending { id };
        self.leave_rx();
        self.requests.push(HardwareRequest::Transmit { id, at });
    }

    fn write_tx(&mut self, bytes: &[u8]) {
        self.tx_fifo.extend_from_slice(bytes);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx_fifo.pop_front()
    }
}

impl FastTimer for SimHardware {
    fn now(&self) -> FastTicks {
        self.local_now
    }

    fn set_alarm(&mut self, alarm: FastAlarm, at: FastTicks) {
        let i = alarm.index();
        self.alarm_generation[i] += 1;
        self.alarms[i] = Some(at);
        self.requests.push(HardwareRequest::Alarm {
            alarm,
            at: self.clock.to_global(at),
            generation: self.alarm_generation[i],
        });
    }

    fn clear_alarm(&mut self, alarm: FastAlarm) {
        let i = alarm.index();
        self.alarm_generation[i] += 1;
        self.alarms[i] = None;
    }

    /// Busy-waits (in simulated time) for the next slow tick edge.
    fn capture_next_slow_tick(&mut self) -> (FastTicks, SlowTicks) {
        let edge = (self.local_now / self.clock_ratio + 1) * self.clock_ratio;
        self.local_now = edge;
        (edge, edge / self.clock_ratio)
    }
}

/// Interrupt enable register of a simulated node.
#[derive(Debug, Clone, Default)]
pub struct SimInterruptMask {
    masked: Rc<Cell<bool>>,
    brackets: Rc<Cell<u32>>,
}

impl SimInterruptMask {
    pub fn is_masked(&self) -> bool {
        self.masked.get()
    }

    /// Number of floods bracketed so far.
    pub fn brackets(&self) -> u32 {
        self.brackets.get()
    }
}

impl InterruptMask for SimInterruptMask {
    type Token = bool;

    fn suppress_others(&self) -> bool {
        self.brackets.set(self.brackets.get() + 1);
        self.masked.replace(true)
    }

    fn restore_others(&self, token: bool) {
        self.masked.set(token);
    }
}

/// Adaptation layer and report source of a simulated node.
#[derive(Debug)]
pub struct NodeHooks {
    address: u8,
    parent: u8,
    data_rate: u16,
    rounds: u32,
    /// Rounds in which the config flood was received (or sent, on the sink).
    rounds_heard: u32,
    active_config: Option<MacConfiguration>,
    events: Vec<NetworkEvent>,
}

impl NodeHooks {
    pub fn new(spec: &NodeSpec) -> Self {
        Self {
            address: spec.address,
            parent: spec.parent,
            data_rate: spec.data_rate,
            rounds: 0,
            rounds_heard: 0,
            active_config: None,
            events: Vec::new(),
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn active_config(&self) -> Option<MacConfiguration> {
        self.active_config
    }

    /// Config flood reception ratio in per mille.
    pub fn prr(&self) -> u16 {
        if self.rounds == 0 {
            return 0;
        }
        (self.rounds_heard as u64 * 1000 / self.rounds as u64) as u16
    }

    pub(crate) fn take_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }
}

impl RoundHooks for NodeHooks {
    fn configuration_changed(&mut self, config: MacConfiguration) {
        self.active_config = Some(config);
        self.events.push(NetworkEvent::ConfigurationChanged {
            address: self.address,
            config,
        });
    }

    fn report_phase(&mut self, phase: &ReportPhase) {
        log::trace!(
            "[{}] report phase of {}: rx={} report={:?}",
            self.address,
            phase.address,
            phase.reception_count,
            phase.report
        );
    }

    fn local_report(&mut self) -> NodeReport {
        NodeReport {
            pkt_rate: self.data_rate,
            prr: self.prr(),
            node_id: self.address,
            parent_id: self.parent,
        }
    }

    fn round_completed(&mut self, summary: &RoundSummary) {
        self.rounds += 1;
        if summary.config_receptions > 0 {
            self.rounds_heard += 1;
        }
        self.events.push(NetworkEvent::RoundCompleted(summary.clone()));
    }
}

/// Everything one simulated node owns.
pub struct SimNode {
    pub spec: NodeSpec,
    pub hw: SimHardware,
    pub engine: FloodEngine,
    pub scheduler: RoundScheduler<SimInterruptMask>,
    pub hooks: NodeHooks,
    pub mask: SimInterruptMask,
}

impl SimNode {
    pub fn new(
        index: usize,
        spec: NodeSpec,
        scheduler_config: SchedulerConfig,
        flood_config: FloodConfig,
        mac_config: MacConfiguration,
    ) -> Self {
        let clock = NodeClock::new(spec.drift_ppm, spec.boot_offset);
        let mask = SimInterruptMask::default();
        let hw = SimHardware::new(index, clock, flood_config.clock_ratio);
        let scheduler = RoundScheduler::new(spec.address, scheduler_config, mask.clone(), mac_config);
        Self {
            hooks: NodeHooks::new(&spec),
            engine: FloodEngine::new(flood_config),
            spec,
            hw,
            scheduler,
            mask,
        }
    }

    pub fn address(&self) -> u8 {
        self.spec.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flood::Edge;

    #[test]
    fn clock_round_trips_through_global_time() {
        let clock = NodeClock::new(40.0, 1_000);
        for local in [1_001u64, 5_000, 4_194_304, 251_658_240_000] {
            let global = clock.to_global(local);
            assert!(clock.local(global) >= local);
            assert!(global == 0 || clock.local(global - 1) < local);
        }
        assert_eq!(NodeClock::new(0.0, 0).to_global(777), 777);
        assert_eq!(clock.to_global(10), 0);
    }

    #[test]
    fn pending_transmission_is_cancelled_by_power_on() {
        let mut hw = SimHardware::new(0, NodeClock::new(0.0, 0), 128);
        hw.prepare(10_000);
        hw.set_tx_anchor(Some(9_990));
        hw.write_tx(&[5, 0xfe, 1, 2]);
        hw.begin_transmit();
        let requests = hw.take_requests();
        let [HardwareRequest::Transmit { id, at }] = requests[..] else {
            panic!("unexpected requests {requests:?}");
        };
        assert_eq!(at, 10_000 + tx_start_delay());
        assert_eq!(hw.mode(), RadioMode::TxPending { id });

        // back to RX before the SFD cancels it
        hw.power_on();
        assert_eq!(hw.start_transmission(id), None);
        assert_eq!(hw.mode(), RadioMode::Rx);
    }

    #[test]
    fn anchor_in_the_past_compensates_handler_latency() {
        let mut hw = SimHardware::new(0, NodeClock::new(0.0, 0), 128);
        hw.prepare(10_000);
        hw.set_tx_anchor(Some(10_008));
        hw.begin_transmit();
        assert!(matches!(
            hw.take_requests()[..],
            [HardwareRequest::Transmit { at, .. }] if at == 10_008 + tx_start_delay()
        ));
    }

    #[test]
    fn cleared_alarm_does_not_fire() {
        let mut hw = SimHardware::new(0, NodeClock::new(0.0, 0), 128);
        hw.set_alarm(FastAlarm::RxTimeout, 500);
        let generation = match hw.take_requests()[..] {
            [HardwareRequest::Alarm { generation, at, .. }] => {
                assert_eq!(at, 500);
                generation
            }
            ref other => panic!("unexpected requests {other:?}"),
        };
        hw.clear_alarm(FastAlarm::RxTimeout);
        assert!(!hw.alarm_due(FastAlarm::RxTimeout, generation));

        hw.set_alarm(FastAlarm::RxTimeout, 900);
        assert!(hw.alarm_due(FastAlarm::RxTimeout, generation + 2));
        assert!(!hw.alarm_due(FastAlarm::RxTimeout, generation + 2));
    }

    #[test]
    fn capture_waits_for_the_next_slow_edge() {
        let mut hw = SimHardware::new(0, NodeClock::new(0.0, 0), 128);
        hw.prepare(1_000);
        assert_eq!(hw.capture_next_slow_tick(), (1_024, 8));
        assert_eq!(hw.now(), 1_024);
        assert_eq!(hw.capture_next_slow_tick(), (1_152, 9));
    }

    #[test]
    fn power_off_drops_the_locked_frame() {
        let mut hw = SimHardware::new(0, NodeClock::new(0.0, 0), 128);
        hw.power_on();
        let epoch = hw.epoch();
        hw.lock(Reception {
            id: 1,
            sources: vec![7],
            start: 0,
            end: 100,
            bytes: vec![4, 0xfe, 9],
            power_mw: 1e-8,
            delivered: 0,
            corrupted: false,
            flushed: false,
        });
        hw.flush_rx();
        assert!(hw.reception().is_some_and(|r| r.flushed));
        hw.power_off();
        assert!(hw.reception().is_none());
        assert_ne!(hw.epoch(), epoch);
        assert_eq!(hw.mode(), RadioMode::Off);
    }

    #[test]
    fn engine_runs_on_simulated_hardware() {
        let spec = NodeSpec {
            address: 3,
            position: super::super::types::Point { x: 0.0, y: 0.0 },
            tx_power: 0.0,
            drift_ppm: 0.0,
            boot_offset: 0,
            parent: 1,
            data_rate: 2,
        };
        let config = SchedulerConfig {
            timing: Default::default(),
            sink_address: 1,
            address_table: vec![3],
        };
        let mut node = SimNode::new(0, spec, config, FloodConfig::default(), MacConfiguration::default());
        let handle = node
            .engine
            .start(&mut node.hw, crate::flood::FloodRequest::receiver(&[0; 6], true, 3))
            .expect("start");
        assert_eq!(node.hw.mode(), RadioMode::Rx);
        // stray falling edge while waiting is ignored
        node.engine.on_frame_boundary(&mut node.hw, Edge::Falling, 0);
        node.engine.stop(&mut node.hw, handle);
        assert_eq!(node.hw.mode(), RadioMode::Off);
        assert_eq!(node.hooks.local_report().parent_id, 1);
    }
}
