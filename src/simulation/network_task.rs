//! Embassy tasks driving a simulation run.
//!
//! `network_task` owns the [`Network`] and releases its events in step with
//! the embassy clock, so a run at 100 % speed takes as long as the deployment
//! would. Each loop:
//! 1) Look up the next queued medium or node event.
//! 2) Sleep until its virtual time (scaled by [`crate::time_driver`]).
//! 3) Process everything due by then and forward the collected events to the
//!    report task.
//!
//! `report_task` turns those events into log lines, including the sink's
//! per-report output, and signals completion when the network is done.

use embassy_time::{Duration, Instant, Timer};
use log::{debug, error, info, warn};

use crate::flood::FastTicks;
use crate::flood::engine::FAST_CLOCK_HZ;
use crate::scheduler::payload::slow_ticks_to_ms;
use crate::scheduler::{MacConfiguration, ProtocolConfig, RoundSummary};

use super::network::Network;
use super::types::{
    CompletionSignal, NetworkEvent, ReportMessage, ReportQueueReceiver, ReportQueueSender, Scene, SimulationOutcome,
};

/// Lag beyond which the run no longer keeps up with the requested speed.
const DELAY_WARNING_THRESHOLD: Duration = Duration::from_millis(10);

fn fast_ticks_to_duration(ticks: FastTicks) -> Duration {
    Duration::from_micros(((ticks as u128 * 1_000_000) / FAST_CLOCK_HZ as u128) as u64)
}

fn duration_to_fast_ticks(duration: Duration) -> FastTicks {
    ((duration.as_micros() as u128 * FAST_CLOCK_HZ as u128) / 1_000_000) as FastTicks
}

/// Central task advancing the simulated network in virtual time.
///
/// The network is built here rather than passed in because its nodes share
/// interrupt-mask state through `Rc` and must stay on the executor thread.
#[embassy_executor::task]
pub async fn network_task(scene: Scene, protocol: ProtocolConfig, report_tx: ReportQueueSender) {
    let mut network = match Network::new(&scene, &protocol) {
        Ok(network) => network,
        Err(e) => {
            error!("Failed to build network: {}", e);
            report_tx.send(ReportMessage::Finished(SimulationOutcome::default())).await;
            return;
        }
    };

    let started = Instant::now();
    let mut delay_warning_issued = false;

    while network.sink_rounds() < scene.rounds {
        let Some(next_event) = network.next_event_time() else {
            warn!("Event queue drained after {} rounds", network.sink_rounds());
            break;
        };

        let due = started + fast_ticks_to_duration(next_event);
        Timer::at(due).await;

        let time_delay = Instant::now().saturating_duration_since(due);
        if time_delay > DELAY_WARNING_THRESHOLD {
            if !delay_warning_issued {
                delay_warning_issued = true;
                warn!("Simulation is lagging {} ms behind virtual time", time_delay.as_millis());
            }
        } else if delay_warning_issued {
            delay_warning_issued = false;
            info!("Simulation caught up with virtual time");
        }

        // Catch up on everything that fell due while we slept, one event at
        // a time so the run stops exactly at the requested round.
        let virtual_now = duration_to_fast_ticks(Instant::now().saturating_duration_since(started)).max(next_event);
        while network.sink_rounds() < scene.rounds && network.next_event_time().is_some_and(|at| at <= virtual_now) {
            network.step();
        }

        for event in network.drain_events() {
            let message = match event {
                NetworkEvent::ConfigurationChanged { address, config } => ReportMessage::ConfigurationChanged { address, config },
                NetworkEvent::RoundCompleted(summary) => ReportMessage::RoundCompleted(summary),
            };
            report_tx.send(message).await;
        }
    }

    report_tx.send(ReportMessage::Finished(network.outcome())).await;
}

/// Logs what the network reports and signals `done` once it finishes.
///
/// `config` is the configuration the sink starts with; it tracks the sink's
/// later changes so report lines show the parameters in force.
#[embassy_executor::task]
pub async fn report_task(report_rx: ReportQueueReceiver, sink: u8, config: MacConfiguration, done: &'static CompletionSignal) {
    let mut sink_config = config;
    loop {
        match report_rx.receive().await {
            ReportMessage::ConfigurationChanged { address, config } => {
                info!(
                    "[{}] configuration changed: t_l={} ms t_s={} ms n={}",
                    address,
                    slow_ticks_to_ms(config.t_l),
                    slow_ticks_to_ms(config.t_s),
                    config.n
                );
                if address == sink {
                    sink_config = config;
                }
            }
            ReportMessage::RoundCompleted(summary) => {
                if summary.address == sink {
                    for line in sink_report_lines(&summary, &sink_config) {
                        info!("{}", line);
                    }
                } else {
                    debug!(
                        "[{}] round {}: captured={} time_to_rx={} bootstrapping={} ref={} skew={} guard={}",
                        summary.address,
                        summary.round,
                        summary.captured,
                        summary.time_to_first_rx.map_or_else(|| "-".to_string(), |t| t.to_string()),
                        summary.bootstrapping,
                        summary.reference_time,
                        summary.period_skew,
                        summary.guard_time
                    );
                }
            }
            ReportMessage::Finished(outcome) => {
                info!(
                    "Finished after {} rounds ({} ms virtual): {}/{} relays synchronized",
                    outcome.rounds,
                    fast_ticks_to_duration(outcome.virtual_time).as_millis(),
                    outcome.synced_relays,
                    outcome.relays
                );
                info!(
                    "Medium: tx={} rx={} corrupted={} constructive={} captured={} collisions={}",
                    outcome.stats.transmissions,
                    outcome.stats.receptions,
                    outcome.stats.corrupted_receptions,
                    outcome.stats.constructive,
                    outcome.stats.captured,
                    outcome.stats.collisions
                );
                done.signal(outcome);
                return;
            }
        }
    }
}

/// The sink's output for one round: a `G` line per report received from the
/// scheduled node once it has a parent, `rx_cnt=0` for a silent slot, and a
/// closing `F`.
pub fn sink_report_lines(summary: &RoundSummary, config: &MacConfiguration) -> Vec<String> {
    let mut lines = Vec::with_capacity(summary.reports.len() + 1);
    for phase in &summary.reports {
        match phase.report {
            Some(report) if phase.reception_count > 0 => {
                if report.parent_id != 0 && report.node_id == phase.address {
                    lines.push(format!(
                        "G o={} p={} pr={} prr={} tl={} ts={} n={}",
                        report.node_id,
                        report.parent_id,
                        report.pkt_rate,
                        report.prr,
                        slow_ticks_to_ms(config.t_l),
                        slow_ticks_to_ms(config.t_s),
                        config.n
                    ));
                }
            }
            _ => lines.push(format!("node_id={} rx_cnt=0", phase.address)),
        }
    }
    lines.push("F".to_string());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{NodeReport, ReportPhase};

    fn summary(reports: Vec<ReportPhase>) -> RoundSummary {
        RoundSummary {
            address: 1,
            round: 3,
            round_start: 0,
            config_receptions: 0,
            captured: false,
            time_to_first_rx: None,
            bootstrapping: false,
            reference_time: 0,
            period_skew: 0,
            guard_time: 17,
            report_slots: reports.iter().map(|r| r.address).collect(),
            reports,
            next_wake: 0,
        }
    }

    #[test]
    fn sink_lines_follow_report_table() {
        let config = MacConfiguration { t_l: 328, t_s: 16384, n: 2 };
        let reports = vec![
            ReportPhase {
                address: 2,
                reception_count: 2,
                report: Some(NodeReport { pkt_rate: 4, prr: 950, node_id: 2, parent_id: 1 }),
            },
            ReportPhase { address: 3, reception_count: 0, report: None },
            // heard, but from a node without a parent yet
            ReportPhase {
                address: 4,
                reception_count: 1,
                report: Some(NodeReport { pkt_rate: 0, prr: 0, node_id: 4, parent_id: 0 }),
            },
        ];
        let lines = sink_report_lines(&summary(reports), &config);
        assert_eq!(
            lines,
            vec![
                "G o=2 p=1 pr=4 prr=950 tl=10 ts=500 n=2".to_string(),
                "node_id=3 rx_cnt=0".to_string(),
                "F".to_string(),
            ]
        );
    }

    #[test]
    fn empty_round_prints_only_terminator() {
        let lines = sink_report_lines(&summary(Vec::new()), &MacConfiguration::default());
        assert_eq!(lines, vec!["F".to_string()]);
    }

    #[test]
    fn virtual_time_conversions() {
        assert_eq!(fast_ticks_to_duration(FAST_CLOCK_HZ), Duration::from_secs(1));
        assert_eq!(duration_to_fast_ticks(Duration::from_millis(1)), 4194);
        assert_eq!(duration_to_fast_ticks(fast_ticks_to_duration(2 * FAST_CLOCK_HZ)), 2 * FAST_CLOCK_HZ);
    }
}
