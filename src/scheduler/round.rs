//! Per-node bookkeeping that persists across rounds.

use crate::flood::SlowTicks;

use super::payload::{ConfigPayload, MacConfiguration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates every config flood and collects the reports.
    Sink,
    Relay,
}

#[derive(Debug, Clone)]
pub struct RoundState {
    role: Role,
    bootstrap_periods: u8,
    bootstrap_counter: u8,
    /// Length of the current run of missed syncs.
    missed_run: u8,
    period_skew: i64,
    previous_reference_time: Option<SlowTicks>,
    sequence_number: u8,
    pending_config: Option<MacConfiguration>,
}

impl RoundState {
    pub fn new(role: Role, bootstrap_periods: u8) -> Self {
        Self {
            role,
            bootstrap_periods,
            bootstrap_counter: 0,
            missed_run: 0,
            period_skew: 0,
            previous_reference_time: None,
            sequence_number: 0,
            pending_config: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrap_counter < self.bootstrap_periods
    }

    pub fn bootstrap_counter(&self) -> u8 {
        self.bootstrap_counter
    }

    /// A bootstrapping relay that missed the reference starts over.
    pub fn reset_bootstrap(&mut self) {
        self.bootstrap_counter = 0;
    }

    pub fn record_sync(&mut self) {
        self.missed_run = 0;
    }

    pub fn record_missed_sync(&mut self) {
        self.missed_run = self.missed_run.saturating_add(1);
    }

    /// Misses that directly follow another miss. A single isolated miss is
    /// absorbed by the regular guard time.
    pub fn consecutive_missed_syncs(&self) -> u8 {
        self.missed_run.saturating_sub(1)
    }

    pub fn guard_time(&self, base: SlowTicks) -> SlowTicks {
        base * (1 + self.consecutive_missed_syncs() as SlowTicks)
    }

    pub fn period_skew(&self) -> i64 {
        self.period_skew
    }

    pub fn previous_reference_time(&self) -> Option<SlowTicks> {
        self.previous_reference_time
    }

    /// Update the skew from this round's reference. Does nothing unless a
    /// reference exists for the round (captured or extrapolated). Returns
    /// true when this round completed the bootstrap.
    pub fn estimate_period_skew(&mut self, synced: bool, reference_time: SlowTicks, period: SlowTicks) -> bool {
        if !synced {
            return false;
        }
        if let Some(previous) = self.previous_reference_time {
            self.period_skew = reference_time as i64 - (previous + period) as i64;
        }
        self.previous_reference_time = Some(reference_time);
        if self.is_bootstrapping() {
            self.bootstrap_counter += 1;
            return !self.is_bootstrapping();
        }
        false
    }

    pub fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    pub fn pending_config(&self) -> Option<MacConfiguration> {
        self.pending_config
    }

    /// Accept `payload` if its sequence number is strictly greater than the
    /// latched one. Returns the configuration to announce, exactly once per
    /// accepted update.
    pub fn latch_configuration(&mut self, payload: &ConfigPayload) -> Option<MacConfiguration> {
        if payload.sequence_number <= self.sequence_number {
            return None;
        }
        self.sequence_number = payload.sequence_number;
        self.pending_config = Some(payload.config);
        Some(payload.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: SlowTicks = 1_000_000;
    const GUARD: SlowTicks = 17;

    fn payload(seq: u8, t_l: u16) -> ConfigPayload {
        ConfigPayload {
            config: MacConfiguration { t_l, t_s: 100, n: 3 },
            sequence_number: seq,
        }
    }

    fn bootstrapped_relay() -> (RoundState, SlowTicks) {
        let mut state = RoundState::new(Role::Relay, 3);
        let mut reference = 5_000;
        for round in 0..3 {
            if round > 0 {
                reference += PERIOD + 2;
            }
            assert!(state.is_bootstrapping());
            let done = state.estimate_period_skew(true, reference, PERIOD);
            assert_eq!(done, round == 2);
        }
        assert!(!state.is_bootstrapping());
        (state, reference)
    }

    #[test]
    fn bootstrap_counts_captures_and_resets_on_miss() {
        let mut state = RoundState::new(Role::Relay, 3);
        state.estimate_period_skew(true, 100, PERIOD);
        state.estimate_period_skew(true, 100 + PERIOD, PERIOD);
        assert_eq!(state.bootstrap_counter(), 2);

        state.reset_bootstrap();
        assert!(!state.estimate_period_skew(false, 0, PERIOD));
        assert_eq!(state.bootstrap_counter(), 0);
        assert!(state.is_bootstrapping());
    }

    #[test]
    fn guard_grows_only_on_consecutive_misses() {
        let (mut state, mut reference) = bootstrapped_relay();
        let mut guards = Vec::new();
        let mut skews = Vec::new();

        for hit in [true, false, true, false, false] {
            if hit {
                state.record_sync();
                reference += PERIOD + 3;
            } else {
                state.record_missed_sync();
                // extrapolated reference
                reference += PERIOD + state.period_skew() as u64;
            }
            state.estimate_period_skew(true, reference, PERIOD);
            skews.push(state.period_skew());
            guards.push(state.guard_time(GUARD));
        }

        assert_eq!(guards, vec![GUARD, GUARD, GUARD, GUARD, 2 * GUARD]);
        assert_eq!(skews, vec![3, 3, 3, 3, 3]);
        assert_eq!(state.consecutive_missed_syncs(), 1);

        state.record_missed_sync();
        assert_eq!(state.guard_time(GUARD), 3 * GUARD);
        state.record_sync();
        assert_eq!(state.guard_time(GUARD), GUARD);
    }

    #[test]
    fn skew_is_recomputed_every_round_after_bootstrap() {
        let (mut state, mut reference) = bootstrapped_relay();
        assert_eq!(state.period_skew(), 2);
        for drift in [4u64, 1, 7] {
            reference += PERIOD + drift;
            state.estimate_period_skew(true, reference, PERIOD);
            assert_eq!(state.period_skew(), drift as i64);
        }
        reference += PERIOD - 5;
        state.estimate_period_skew(true, reference, PERIOD);
        assert_eq!(state.period_skew(), -5);
    }

    #[test]
    fn latch_accepts_only_strictly_greater_sequence_numbers() {
        let mut state = RoundState::new(Role::Relay, 3);
        assert_eq!(state.latch_configuration(&payload(0, 10)), None);
        assert_eq!(state.pending_config(), None);

        assert_eq!(state.latch_configuration(&payload(2, 20)).map(|c| c.t_l), Some(20));
        assert_eq!(state.latch_configuration(&payload(2, 20)), None);
        assert_eq!(state.latch_configuration(&payload(1, 30)), None);
        assert_eq!(state.pending_config().map(|c| c.t_l), Some(20));

        assert_eq!(state.latch_configuration(&payload(7, 40)).map(|c| c.t_l), Some(40));
        assert_eq!(state.sequence_number(), 7);
    }
}
