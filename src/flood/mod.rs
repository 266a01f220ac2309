//! Glossy-style flooding primitive.
//!
//! - `frame`: wire layout and field accessors
//! - `hardware`: radio, timer and interrupt-mask traits the engine runs on
//! - `engine`: the interrupt-driven receive/relay state machine

pub mod engine;
pub mod frame;
pub mod hardware;

pub use engine::{Edge, FloodConfig, FloodEngine, FloodError, FloodOutcome, FloodRequest, FloodStatus, SessionHandle};
pub use hardware::{FastAlarm, FastTicks, FastTimer, FloodHardware, InterruptMask, InterruptMaskGuard, Radio, SlowTicks};
