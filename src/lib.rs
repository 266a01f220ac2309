//! Glossy flooding with a synchronized round scheduler, and a simulated
//! 802.15.4 network to run it on.
//!
//! - [`flood`]: the flood engine driven by frame-boundary edges and fast-clock alarms
//! - [`sync_clock`]: reference time and slot-duration estimation
//! - [`scheduler`]: config flood plus report floods per period
//! - [`simulation`]: medium, nodes and embassy tasks for the runner binary

pub mod flood;
pub mod scheduler;
pub mod simulation;
pub mod sync_clock;
pub mod time_driver;
