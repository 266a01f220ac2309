//! Network-wide time reference derived from flood timing.
//!
//! Every relay retransmits a frame a fixed processing delay after receiving
//! it, so the interval between two consecutive relay steps (a "slot") is the
//! same at every node. Measuring it locally lets a node back-project any
//! reception to the instant the initiator started the flood (relay count 0),
//! which is the same physical instant for every node regardless of its hop
//! distance.

use crate::flood::hardware::{FastTicks, SlowTicks};

/// Default number of single-hop samples averaged into the slot estimate.
pub const DEFAULT_SYNC_WINDOW: u32 = 64;
/// Default ratio between the fast and slow clock frequencies (4 194 304 Hz / 32 768 Hz).
pub const DEFAULT_CLOCK_RATIO: u64 = 128;

/// Edge timestamps spanning two slots: our last transmission and the
/// reception that immediately followed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HopTimestamps {
    /// End of the reception we relayed.
    pub previous_rx_stop: FastTicks,
    pub tx_start: FastTicks,
    pub tx_stop: FastTicks,
    /// Start of the reception that follows our transmission.
    pub rx_start: FastTicks,
}

/// Sliding-window estimate of one relay hop in fast-clock ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEstimate {
    slot_duration: FastTicks,
    sum: u64,
    window_count: u32,
    window: u32,
}

impl TimingEstimate {
    fn new(window: u32) -> Self {
        Self {
            slot_duration: 0,
            sum: 0,
            window_count: 0,
            window: window.max(1),
        }
    }

    fn add_sample(&mut self, sample: FastTicks) {
        self.sum += sample;
        self.window_count += 1;
        if self.window_count == self.window {
            self.slot_duration = self.sum / self.window as u64;
            // keep half the history so the estimate follows slow drift
            self.sum /= 2;
            self.window_count /= 2;
        } else if self.window_count == 1 {
            self.slot_duration = sample;
        }
    }

    pub fn slot_duration(&self) -> FastTicks {
        self.slot_duration
    }

    pub fn window_count(&self) -> u32 {
        self.window_count
    }
}

/// Local clock value of the current flood's logical origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReference {
    /// Slow-clock tick at (or just before) relay count 0.
    pub reference_time: SlowTicks,
    /// Fast ticks separating `reference_time` from the true origin.
    pub sub_tick_offset: FastTicks,
    /// Relay count of the frame the reference was derived from.
    pub relay_count_at_capture: u8,
    /// Set at most once per flood, cleared when a new flood starts.
    pub updated: bool,
}

#[derive(Debug, Clone)]
pub struct SyncClock {
    estimate: TimingEstimate,
    reference: SyncReference,
    clock_ratio: u64,
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_WINDOW, DEFAULT_CLOCK_RATIO)
    }
}

impl SyncClock {
    pub fn new(window: u32, clock_ratio: u64) -> Self {
        Self {
            estimate: TimingEstimate::new(window),
            reference: SyncReference::default(),
            clock_ratio: clock_ratio.max(1),
        }
    }

    /// Fold one single-hop measurement into the slot estimate.
    ///
    /// Only used when the reception directly follows our own last
    /// transmission (`relay_count == last_tx_relay + 2`) and at least one
    /// earlier reception exists, so that all four sub-intervals belong to
    /// the same two consecutive slots. Returns the sample when it was used.
    pub fn estimate_slot_lengths(
        &mut self,
        reception_count: u8,
        relay_count: u8,
        last_tx_relay: u8,
        hop: &HopTimestamps,
        rx_stop: FastTicks,
    ) -> Option<FastTicks> {
        if reception_count <= 1 || relay_count != last_tx_relay.wrapping_add(2) {
            return None;
        }
        let wait_rx_to_tx = hop.tx_start.saturating_sub(hop.previous_rx_stop);
        let tx = hop.tx_stop.saturating_sub(hop.tx_start);
        let wait_tx_to_rx = hop.rx_start.saturating_sub(hop.tx_stop);
        let rx = rx_stop.saturating_sub(hop.rx_start);
        let sample = (tx + wait_tx_to_rx + rx + wait_rx_to_tx) / 2;
        self.estimate.add_sample(sample);
        Some(sample)
    }

    /// Anchor the local slow clock to the flood origin.
    ///
    /// `capture` holds both clocks sampled on the next slow tick edge after
    /// the reception that started at `rx_start` with relay count
    /// `relay_count` (already incremented by this node). Does nothing once a
    /// reference exists for the current flood or while the slot is unknown.
    pub fn compute_sync_reference_point(&mut self, relay_count: u8, rx_start: FastTicks, capture: (FastTicks, SlowTicks)) -> bool {
        if self.reference.updated || self.estimate.slot_duration == 0 {
            return false;
        }
        let (capture_fast, capture_slow) = capture;
        let rx_to_capture = capture_fast.saturating_sub(rx_start);
        let origin_to_rx = relay_count.saturating_sub(1) as u64 * self.estimate.slot_duration;
        let origin_to_capture = origin_to_rx + rx_to_capture;
        let origin_to_capture_slow = 1 + origin_to_capture / self.clock_ratio;

        self.reference = SyncReference {
            reference_time: capture_slow.saturating_sub(origin_to_capture_slow),
            sub_tick_offset: (self.clock_ratio - 1) - (origin_to_capture % self.clock_ratio),
            relay_count_at_capture: relay_count.saturating_sub(1),
            updated: true,
        };
        true
    }

    pub fn slot_duration(&self) -> FastTicks {
        self.estimate.slot_duration
    }

    pub fn estimate(&self) -> &TimingEstimate {
        &self.estimate
    }

    pub fn reference(&self) -> SyncReference {
        self.reference
    }

    pub fn reference_time(&self) -> SlowTicks {
        self.reference.reference_time
    }

    pub fn is_updated(&self) -> bool {
        self.reference.updated
    }

    /// Overwrite the reference, used to extrapolate across a missed flood.
    pub fn set_reference_time(&mut self, reference_time: SlowTicks) {
        self.reference.reference_time = reference_time;
    }

    pub fn set_updated(&mut self, updated: bool) {
        self.reference.updated = updated;
    }

    pub fn clear_updated(&mut self) {
        self.reference.updated = false;
    }

    pub fn clock_ratio(&self) -> u64 {
        self.clock_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(wait_rx_to_tx: u64, tx: u64, wait_tx_to_rx: u64) -> HopTimestamps {
        let previous_rx_stop = 10_000;
        let tx_start = previous_rx_stop + wait_rx_to_tx;
        let tx_stop = tx_start + tx;
        HopTimestamps {
            previous_rx_stop,
            tx_start,
            tx_stop,
            rx_start: tx_stop + wait_tx_to_rx,
        }
    }

    #[test]
    fn slot_estimate_converges_for_identical_hops() {
        let mut clock = SyncClock::new(8, DEFAULT_CLOCK_RATIO);
        let timestamps = hop(400, 1000, 500);
        // rx of 1100 ticks: (1000 + 500 + 1100 + 400) / 2 = 1500
        for _ in 0..12 {
            let sample = clock.estimate_slot_lengths(2, 4, 2, &timestamps, timestamps.rx_start + 1100);
            assert_eq!(sample, Some(1500));
        }
        assert!(clock.slot_duration().abs_diff(1500) <= 1);
        assert!(clock.estimate().window_count() < 8);
    }

    #[test]
    fn slot_estimate_smooths_jitter_once_window_fills() {
        let mut clock = SyncClock::new(8, DEFAULT_CLOCK_RATIO);
        for i in 0..16u64 {
            let timestamps = hop(400, 1000, 500);
            let rx = if i % 2 == 0 { 1098 } else { 1102 };
            clock.estimate_slot_lengths(3, 6, 4, &timestamps, timestamps.rx_start + rx);
        }
        assert!(clock.slot_duration().abs_diff(1500) <= 1, "slot {}", clock.slot_duration());
    }

    #[test]
    fn sample_is_ignored_unless_it_follows_our_transmission() {
        let mut clock = SyncClock::default();
        let timestamps = hop(400, 1000, 500);
        assert_eq!(clock.estimate_slot_lengths(1, 2, 0, &timestamps, timestamps.rx_start + 1100), None);
        assert_eq!(clock.estimate_slot_lengths(3, 5, 2, &timestamps, timestamps.rx_start + 1100), None);
        assert_eq!(clock.slot_duration(), 0);
    }

    #[test]
    fn reference_point_back_projects_to_relay_zero() {
        let mut clock = SyncClock::new(1, 128);
        let timestamps = hop(0, 1000, 0);
        // single-sample window adopts (1000 + 0 + 1000 + 0) / 2
        clock.estimate_slot_lengths(2, 2, 0, &timestamps, timestamps.rx_start + 1000);
        assert_eq!(clock.slot_duration(), 1000);

        assert!(clock.compute_sync_reference_point(3, 10_000, (10_300, 81)));
        let reference = clock.reference();
        // 300 + 2 * 1000 = 2300 fast ticks = 17 slow ticks + 124
        assert_eq!(reference.reference_time, 81 - 18);
        assert_eq!(reference.sub_tick_offset, 3);
        assert_eq!(reference.relay_count_at_capture, 2);
        assert!(reference.updated);
    }

    #[test]
    fn reference_point_is_computed_once_per_flood() {
        let mut clock = SyncClock::new(1, 128);
        let timestamps = hop(0, 1000, 0);
        clock.estimate_slot_lengths(2, 2, 0, &timestamps, timestamps.rx_start + 1000);

        assert!(clock.compute_sync_reference_point(1, 5_000, (5_100, 40)));
        let first = clock.reference();
        assert!(!clock.compute_sync_reference_point(4, 9_000, (9_100, 71)));
        assert_eq!(clock.reference(), first);

        clock.clear_updated();
        assert!(clock.compute_sync_reference_point(4, 9_000, (9_100, 71)));
        assert_ne!(clock.reference_time(), first.reference_time);
    }

    #[test]
    fn reference_point_needs_a_slot_estimate() {
        let mut clock = SyncClock::default();
        assert!(!clock.compute_sync_reference_point(1, 0, (128, 1)));
        assert!(!clock.is_updated());
    }
}
