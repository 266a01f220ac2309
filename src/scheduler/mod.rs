//! Round scheduler: one synchronized config flood per period followed by
//! one report flood per entry of the address table.

pub mod config;
pub mod payload;
pub mod round;
pub mod task;

pub use config::{ProtocolConfig, SchedulerConfig, TimingConfig};
pub use payload::{ConfigPayload, MacConfiguration, NodeReport, PayloadError};
pub use round::{Role, RoundState};
pub use task::{Phase, ReportPhase, RoundHooks, RoundScheduler, RoundSummary};
