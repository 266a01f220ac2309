//! Simulated IEEE 802.15.4 deployment running the flood engine and the round
//! scheduler unmodified.
//!
//! ## Module Organization
//!
//! - `types`: Scene description, validation, report channel types
//! - `signal_calculations`: Path loss and PHY timing
//! - `node`: Per-node drifting clock, simulated radio/timer, interrupt mask
//! - `network`: Discrete-event medium (constructive interference, capture,
//!   collisions) and the event loop
//! - `network_task`: Embassy tasks pacing the run and logging the results
//!
//! `network_task` and `report_task` are the entry points spawned on the
//! executor; tests drive [`Network`] directly.

pub mod network;
pub mod network_task;
pub mod node;
pub mod signal_calculations;
pub mod types;

pub use network::Network;
pub use network_task::{network_task, report_task, sink_report_lines};
pub use types::{
    CompletionSignal, NetworkEvent, Point, ReportMessage, ReportQueue, Scene, SceneError, SimulationOutcome, load_scene,
};
