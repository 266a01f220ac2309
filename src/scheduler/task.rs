//! Resumable round scheduler.
//!
//! The platform calls [`RoundScheduler::on_wake`] whenever the slow-clock
//! alarm it was last given expires. Each call starts or stops exactly one
//! flood and returns the next wake time, so a round is the sequence
//!
//! ```text
//! ConfigFlood -> ConfigRunning -> ReportSlot(0) -> ReportRunning(0) -> ... -> ConfigFlood
//! ```
//!
//! with the report phases skipped while the node is bootstrapping.

use crate::flood::{
    FastTicks, FloodEngine, FloodHardware, FloodOutcome, FloodRequest, InterruptMask, InterruptMaskGuard, SessionHandle, SlowTicks,
};

use super::config::SchedulerConfig;
use super::payload::{ConfigPayload, MacConfiguration, NodeReport, REPORT_PAYLOAD_LEN};
use super::round::{Role, RoundState};

/// Collaborators of the scheduler outside the flooding core.
pub trait RoundHooks {
    /// A configuration with a newer sequence number was latched.
    fn configuration_changed(&mut self, config: MacConfiguration);
    /// Sink only: outcome of one report phase.
    fn report_phase(&mut self, _phase: &ReportPhase) {}
    /// Report this node sends in its own slot.
    fn local_report(&mut self) -> NodeReport;
    fn round_completed(&mut self, _summary: &RoundSummary) {}
}

/// What the sink heard in one report phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPhase {
    /// Scheduled initiator of the phase.
    pub address: u8,
    pub reception_count: u8,
    pub report: Option<NodeReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub address: u8,
    pub round: u32,
    pub round_start: SlowTicks,
    /// Receptions during the config flood.
    pub config_receptions: u8,
    /// The reference was captured in this round rather than extrapolated.
    pub captured: bool,
    /// Fast ticks from switching the receiver on to the first config flood
    /// reception. `None` on the sink and in rounds without a reception.
    pub time_to_first_rx: Option<FastTicks>,
    pub bootstrapping: bool,
    pub reference_time: SlowTicks,
    pub period_skew: i64,
    pub guard_time: SlowTicks,
    /// Initiator addresses of the report phases run this round, in order.
    pub report_slots: Vec<u8>,
    /// Sink only.
    pub reports: Vec<ReportPhase>,
    pub next_wake: SlowTicks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ConfigFlood,
    ConfigRunning,
    ReportSlot(usize),
    ReportRunning(usize),
}

/// A started flood together with the interrupt bracket around it.
struct ActiveFlood<M: InterruptMask> {
    handle: SessionHandle,
    guard: InterruptMaskGuard<M>,
}

pub struct RoundScheduler<M: InterruptMask + Clone> {
    address: u8,
    config: SchedulerConfig,
    state: RoundState,
    mask: M,
    phase: Phase,
    round: u32,
    round_start: SlowTicks,
    config_payload: ConfigPayload,
    config_receptions: u8,
    captured: bool,
    time_to_first_rx: Option<FastTicks>,
    report_slots: Vec<u8>,
    reports: Vec<ReportPhase>,
    active: Option<ActiveFlood<M>>,
}

impl<M: InterruptMask + Clone> RoundScheduler<M> {
    /// `initial_config` is what the sink disseminates; relays ignore it until
    /// they receive one.
    pub fn new(address: u8, config: SchedulerConfig, mask: M, initial_config: MacConfiguration) -> Self {
        let role = if address == config.sink_address { Role::Sink } else { Role::Relay };
        let config_payload = match role {
            Role::Sink => ConfigPayload {
                config: initial_config,
                sequence_number: 0,
            },
            Role::Relay => ConfigPayload::default(),
        };
        let state = RoundState::new(role, config.timing.bootstrap_periods);
        Self {
            address,
            config,
            state,
            mask,
            phase: Phase::ConfigFlood,
            round: 0,
            round_start: 0,
            config_payload,
            config_receptions: 0,
            captured: false,
            time_to_first_rx: None,
            report_slots: Vec::new(),
            reports: Vec::new(),
            active: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Payload of the last config flood (sent by the sink, received by relays).
    pub fn config_payload(&self) -> ConfigPayload {
        self.config_payload
    }

    /// Sink only: disseminate `config` from the next round on under a new
    /// sequence number. Returns false on relays or once sequence numbers are
    /// exhausted.
    pub fn update_configuration(&mut self, config: MacConfiguration) -> bool {
        if self.state.role() != Role::Sink {
            log::warn!("[{}] ignoring configuration update on a relay", self.address);
            return false;
        }
        let Some(sequence_number) = self.config_payload.sequence_number.checked_add(1) else {
            log::warn!("[{}] configuration sequence numbers exhausted", self.address);
            return false;
        };
        self.config_payload = ConfigPayload { config, sequence_number };
        log::debug!("[{}] configuration update queued as seq {}", self.address, sequence_number);
        true
    }

    /// Run one scheduling step at `now` and return the next wake time.
    pub fn on_wake<H, R>(&mut self, now: SlowTicks, engine: &mut FloodEngine, hw: &mut H, hooks: &mut R) -> SlowTicks
    where
        H: FloodHardware,
        R: RoundHooks,
    {
        let next = match self.phase {
            Phase::ConfigFlood => self.start_config_flood(now, engine, hw),
            Phase::ConfigRunning => self.finish_config_flood(now, engine, hw, hooks),
            Phase::ReportSlot(index) => self.start_report_flood(index, engine, hw, hooks),
            Phase::ReportRunning(index) => self.finish_report_flood(index, now, engine, hw, hooks),
        };
        if next <= now {
            log::warn!("[{}] next wake {} not after {}, waking immediately", self.address, next, now);
            return now + 1;
        }
        next
    }

    fn start_config_flood(&mut self, now: SlowTicks, engine: &mut FloodEngine, hw: &mut impl FloodHardware) -> SlowTicks {
        let timing = &self.config.timing;
        self.round_start = now;
        self.report_slots.clear();
        self.reports.clear();
        self.phase = Phase::ConfigRunning;

        let bytes = self.config_payload.to_bytes();
        let n = timing.retransmissions;
        let (request, listen) = match self.state.role() {
            Role::Sink => (FloodRequest::initiator(&bytes, true, n), timing.flood_duration),
            Role::Relay if self.state.is_bootstrapping() => {
                (FloodRequest::receiver(&bytes, true, n), timing.init_duration())
            }
            Role::Relay => (
                FloodRequest::receiver(&bytes, true, n),
                self.state.guard_time(timing.guard_time) + timing.flood_duration,
            ),
        };
        log::debug!(
            "[{}] round {} config flood at {} for {} ticks",
            self.address,
            self.round,
            now,
            listen
        );
        self.begin_flood(engine, hw, request);
        now + listen
    }

    fn finish_config_flood<R: RoundHooks>(
        &mut self,
        now: SlowTicks,
        engine: &mut FloodEngine,
        hw: &mut impl FloodHardware,
        hooks: &mut R,
    ) -> SlowTicks {
        let outcome = self.end_flood(engine, hw);
        self.config_receptions = outcome.as_ref().map(|o| o.reception_count).unwrap_or(0);
        if self.state.role() == Role::Relay && self.config_receptions > 0 {
            if let Some(outcome) = &outcome {
                match ConfigPayload::from_bytes(&outcome.payload) {
                    Ok(payload) => self.config_payload = payload,
                    Err(e) => log::warn!("[{}] discarding config payload: {}", self.address, e),
                }
            }
        }

        let timing = &self.config.timing;
        self.captured = engine.sync_clock().is_updated();
        self.time_to_first_rx = match self.state.role() {
            Role::Relay if self.config_receptions > 0 => engine.time_to_first_rx(),
            _ => None,
        };
        log::debug!(
            "[{}] config flood done: rx={} captured={} reference={}",
            self.address,
            self.config_receptions,
            self.captured,
            engine.sync_clock().reference_time()
        );

        if self.state.is_bootstrapping() {
            if self.state.role() == Role::Relay && !self.captured {
                self.state.reset_bootstrap();
            }
            return self.finish_round(now, engine, hooks);
        }

        if !self.captured {
            let clock = engine.sync_clock_mut();
            let extrapolated = match self.state.role() {
                Role::Sink => clock.reference_time() + timing.period,
                Role::Relay => offset(clock.reference_time() + timing.period, self.state.period_skew()),
            };
            clock.set_reference_time(extrapolated);
            clock.set_updated(true);
            if self.state.role() == Role::Relay {
                self.state.record_missed_sync();
            }
        } else if self.state.role() == Role::Relay {
            self.state.record_sync();
        }

        if self.config.address_table.is_empty() {
            return self.finish_round(now, engine, hooks);
        }
        self.phase = Phase::ReportSlot(0);
        engine.sync_clock().reference_time() + timing.report_offset(0)
    }

    fn start_report_flood<R: RoundHooks>(
        &mut self,
        index: usize,
        engine: &mut FloodEngine,
        hw: &mut impl FloodHardware,
        hooks: &mut R,
    ) -> SlowTicks {
        let timing = &self.config.timing;
        let slot_address = self.config.address_table[index];
        let n = timing.retransmissions;
        let wake = engine.sync_clock().reference_time() + timing.report_offset(index) + timing.flood_duration;
        self.report_slots.push(slot_address);
        self.phase = Phase::ReportRunning(index);

        let own_slot = self.state.role() == Role::Relay && slot_address == self.address;
        let bytes = if own_slot {
            hooks.local_report().to_bytes()
        } else {
            [0u8; REPORT_PAYLOAD_LEN]
        };
        let request = if own_slot {
            FloodRequest::initiator(&bytes, false, n)
        } else {
            FloodRequest::receiver(&bytes, false, n)
        };
        log::debug!(
            "[{}] report phase {} for node {} as {}",
            self.address,
            index,
            slot_address,
            if own_slot { "initiator" } else { "receiver" }
        );
        self.begin_flood(engine, hw, request);
        wake
    }

    fn finish_report_flood<R: RoundHooks>(
        &mut self,
        index: usize,
        now: SlowTicks,
        engine: &mut FloodEngine,
        hw: &mut impl FloodHardware,
        hooks: &mut R,
    ) -> SlowTicks {
        let outcome = self.end_flood(engine, hw);
        if self.state.role() == Role::Sink {
            let reception_count = outcome.as_ref().map(|o| o.reception_count).unwrap_or(0);
            let report = outcome
                .filter(|o| o.reception_count > 0)
                .and_then(|o| NodeReport::from_bytes(&o.payload).ok());
            let phase = ReportPhase {
                address: self.config.address_table[index],
                reception_count,
                report,
            };
            hooks.report_phase(&phase);
            self.reports.push(phase);
        }

        let next_index = index + 1;
        if next_index < self.config.address_table.len() {
            self.phase = Phase::ReportSlot(next_index);
            engine.sync_clock().reference_time() + self.config.timing.report_offset(next_index)
        } else {
            self.finish_round(now, engine, hooks)
        }
    }

    fn finish_round<R: RoundHooks>(&mut self, now: SlowTicks, engine: &FloodEngine, hooks: &mut R) -> SlowTicks {
        let timing = &self.config.timing;
        let clock = engine.sync_clock();
        let reference = clock.reference_time();
        if self
            .state
            .estimate_period_skew(clock.is_updated(), reference, timing.period)
        {
            log::info!(
                "[{}] bootstrap complete after round {}, period skew {}",
                self.address,
                self.round,
                self.state.period_skew()
            );
        }

        let next_wake = match self.state.role() {
            Role::Sink => self.round_start + timing.period,
            Role::Relay if self.state.is_bootstrapping() => {
                if self.state.bootstrap_counter() == 0 {
                    now + timing.init_period() - timing.init_duration()
                } else {
                    reference + timing.period - timing.init_guard_time
                }
            }
            Role::Relay => offset(reference + timing.period, self.state.period_skew())
                .saturating_sub(self.state.guard_time(timing.guard_time)),
        };

        if let Some(config) = self.state.latch_configuration(&self.config_payload) {
            log::info!(
                "[{}] configuration changed: seq={} t_l={} t_s={} n={}",
                self.address,
                self.state.sequence_number(),
                config.t_l,
                config.t_s,
                config.n
            );
            hooks.configuration_changed(config);
        }

        let summary = RoundSummary {
            address: self.address,
            round: self.round,
            round_start: self.round_start,
            config_receptions: self.config_receptions,
            captured: self.captured,
            time_to_first_rx: self.time_to_first_rx,
            bootstrapping: self.state.is_bootstrapping(),
            reference_time: reference,
            period_skew: self.state.period_skew(),
            guard_time: self.state.guard_time(timing.guard_time),
            report_slots: std::mem::take(&mut self.report_slots),
            reports: std::mem::take(&mut self.reports),
            next_wake,
        };
        log::debug!(
            "[{}] round {} done: skew={} guard={} next wake {}",
            self.address,
            self.round,
            summary.period_skew,
            summary.guard_time,
            next_wake
        );
        hooks.round_completed(&summary);

        self.round += 1;
        self.phase = Phase::ConfigFlood;
        next_wake
    }

    fn begin_flood(&mut self, engine: &mut FloodEngine, hw: &mut impl FloodHardware, request: FloodRequest<'_>) {
        let guard = InterruptMaskGuard::acquire(self.mask.clone());
        match engine.start(hw, request) {
            Ok(handle) => self.active = Some(ActiveFlood { handle, guard }),
            Err(e) => {
                log::warn!("[{}] flood not started: {}", self.address, e);
                guard.release();
            }
        }
    }

    fn end_flood(&mut self, engine: &mut FloodEngine, hw: &mut impl FloodHardware) -> Option<FloodOutcome> {
        let active = self.active.take()?;
        let outcome = engine.stop(hw, active.handle);
        active.guard.release();
        Some(outcome)
    }
}

fn offset(base: SlowTicks, delta: i64) -> SlowTicks {
    base.saturating_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flood::{FastAlarm, FastTicks, FastTimer, FloodConfig, Radio};
    use crate::scheduler::config::TimingConfig;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct QuietHardware {
        writes: Vec<Vec<u8>>,
        transmissions: usize,
    }

    impl Radio for QuietHardware {
        fn flush_rx(&mut self) {}
        fn flush_tx(&mut self) {}
        fn power_on(&mut self) {}
        fn power_off(&mut self) {}
        fn begin_transmit(&mut self) {
            self.transmissions += 1;
        }
        fn write_tx(&mut self, bytes: &[u8]) {
            self.writes.push(bytes.to_vec());
        }
        fn read_byte(&mut self) -> Option<u8> {
            None
        }
    }

    impl FastTimer for QuietHardware {
        fn now(&self) -> FastTicks {
            0
        }
        fn set_alarm(&mut self, _alarm: FastAlarm, _at: FastTicks) {}
        fn clear_alarm(&mut self, _alarm: FastAlarm) {}
        fn capture_next_slow_tick(&mut self) -> (FastTicks, SlowTicks) {
            (0, 0)
        }
    }

    #[derive(Clone, Default)]
    struct CountingMask {
        depth: Rc<Cell<i32>>,
    }

    impl InterruptMask for CountingMask {
        type Token = ();
        fn suppress_others(&self) {
            self.depth.set(self.depth.get() + 1);
        }
        fn restore_others(&self, _token: ()) {
            self.depth.set(self.depth.get() - 1);
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        changes: Vec<MacConfiguration>,
        phases: Vec<ReportPhase>,
        summaries: Vec<RoundSummary>,
    }

    impl RoundHooks for RecordingHooks {
        fn configuration_changed(&mut self, config: MacConfiguration) {
            self.changes.push(config);
        }
        fn report_phase(&mut self, phase: &ReportPhase) {
            self.phases.push(phase.clone());
        }
        fn local_report(&mut self) -> NodeReport {
            NodeReport {
                pkt_rate: 4,
                prr: 950,
                node_id: 9,
                parent_id: 5,
            }
        }
        fn round_completed(&mut self, summary: &RoundSummary) {
            self.summaries.push(summary.clone());
        }
    }

    const SINK: u8 = 200;

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            timing: TimingConfig::default(),
            sink_address: SINK,
            address_table: vec![5, 9, 12],
        }
    }

    struct Harness {
        scheduler: RoundScheduler<CountingMask>,
        engine: FloodEngine,
        hw: QuietHardware,
        hooks: RecordingHooks,
        mask: CountingMask,
        now: SlowTicks,
    }

    impl Harness {
        fn new(address: u8) -> Self {
            let mask = CountingMask::default();
            let initial = MacConfiguration { t_l: 328, t_s: 3277, n: 3 };
            Self {
                scheduler: RoundScheduler::new(address, scheduler_config(), mask.clone(), initial),
                engine: FloodEngine::new(FloodConfig::default()),
                hw: QuietHardware::default(),
                hooks: RecordingHooks::default(),
                mask,
                now: 1_000,
            }
        }

        fn wake(&mut self) -> SlowTicks {
            let next = self
                .scheduler
                .on_wake(self.now, &mut self.engine, &mut self.hw, &mut self.hooks);
            self.now = next;
            next
        }

        /// Run one full round; `capture` is the reference the config flood
        /// yields, if any.
        fn round(&mut self, capture: Option<SlowTicks>) -> RoundSummary {
            assert_eq!(self.scheduler.phase(), Phase::ConfigFlood);
            self.wake();
            assert_eq!(self.mask.depth.get(), 1);
            if let Some(reference) = capture {
                let clock = self.engine.sync_clock_mut();
                clock.set_reference_time(reference);
                clock.set_updated(true);
            }
            loop {
                self.wake();
                if self.scheduler.phase() == Phase::ConfigFlood {
                    break;
                }
            }
            assert_eq!(self.mask.depth.get(), 0);
            self.hooks.summaries.last().cloned().expect("summary")
        }
    }

    #[test]
    fn relay_bootstraps_then_tracks_skew_and_guard() {
        let timing = TimingConfig::default();
        let mut h = Harness::new(9);

        // nothing heard: retry after the init period
        let summary = h.round(None);
        assert!(summary.bootstrapping);
        assert_eq!(summary.next_wake, summary.round_start + timing.init_period());

        let mut reference = 50_000;
        for _ in 0..3 {
            let summary = h.round(Some(reference));
            assert!(summary.report_slots.is_empty());
            reference += timing.period + 2;
        }
        let last = h.hooks.summaries.last().cloned().expect("summary");
        assert!(!last.bootstrapping);
        assert_eq!(last.period_skew, 2);
        assert_eq!(last.next_wake, last.reference_time + timing.period + 2 - timing.guard_time);

        let mut guards = Vec::new();
        for hit in [true, false, true, false, false] {
            let summary = h.round(hit.then_some(reference));
            assert_eq!(summary.report_slots, vec![5, 9, 12]);
            assert_eq!(summary.next_wake, offset(summary.reference_time + timing.period, summary.period_skew) - summary.guard_time);
            guards.push(summary.guard_time);
            reference = summary.reference_time + timing.period + 2;
        }
        let g = timing.guard_time;
        assert_eq!(guards, vec![g, g, g, g, 2 * g]);
        assert_eq!(h.scheduler.state().consecutive_missed_syncs(), 1);
    }

    #[test]
    fn relay_initiates_only_its_own_report_slot() {
        let timing = TimingConfig::default();
        let mut h = Harness::new(9);
        let mut reference = 10_000;
        for _ in 0..3 {
            h.round(Some(reference));
            reference += timing.period;
        }
        h.hw.writes.clear();
        h.hw.transmissions = 0;

        h.wake();
        let clock = h.engine.sync_clock_mut();
        clock.set_reference_time(reference);
        clock.set_updated(true);
        let mut wakes = vec![h.wake()];
        while h.scheduler.phase() != Phase::ConfigFlood {
            wakes.push(h.wake());
        }

        let expected: Vec<SlowTicks> = (0..3)
            .flat_map(|i| {
                let start = reference + timing.report_offset(i);
                [start, start + timing.flood_duration]
            })
            .collect();
        assert_eq!(wakes[..6], expected[..]);
        assert_eq!(h.hw.transmissions, 1);
        let report = NodeReport::from_bytes(&h.hw.writes[0][2..8]).expect("report");
        assert_eq!(report.node_id, 9);
        assert_eq!(report.parent_id, 5);
    }

    #[test]
    fn sink_visits_every_report_phase_in_table_order() {
        let timing = TimingConfig::default();
        let mut h = Harness::new(SINK);
        assert_eq!(h.scheduler.role(), Role::Sink);

        // bootstrap on the sink's own captures
        let mut reference = 2_000;
        for _ in 0..3 {
            let summary = h.round(Some(reference));
            assert_eq!(summary.next_wake, summary.round_start + timing.period);
            reference += timing.period;
        }
        // a missed capture is extrapolated by one period
        let summary = h.round(None);
        assert!(!summary.captured);
        assert_eq!(summary.reference_time, reference);
        assert_eq!(summary.report_slots, vec![5, 9, 12]);
        let addresses: Vec<u8> = h.hooks.phases.iter().map(|p| p.address).collect();
        assert_eq!(addresses, vec![5, 9, 12]);
        assert!(h.hooks.phases.iter().all(|p| p.reception_count == 0 && p.report.is_none()));
        assert_eq!(summary.reports.len(), 3);
    }

    #[test]
    fn sink_configuration_update_is_latched_once() {
        let mut h = Harness::new(SINK);
        h.round(None);
        assert!(h.hooks.changes.is_empty());

        let update = MacConfiguration { t_l: 500, t_s: 5_000, n: 2 };
        assert!(h.scheduler.update_configuration(update));
        h.round(None);
        h.round(None);
        assert_eq!(h.hooks.changes, vec![update]);
        assert_eq!(h.scheduler.state().sequence_number(), 1);
        assert_eq!(h.hw.writes.last().map(|w| w[2..8].to_vec()), Some(h.scheduler.config_payload().to_bytes().to_vec()));
    }

    #[test]
    fn relay_rejects_configuration_updates() {
        let mut h = Harness::new(12);
        assert!(!h.scheduler.update_configuration(MacConfiguration::default()));
        assert_eq!(h.scheduler.config_payload(), ConfigPayload::default());
    }
}
