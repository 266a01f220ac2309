//! Discrete-event model of the shared 802.15.4 medium and the nodes on it.
//!
//! Every node runs the unmodified flood engine and round scheduler on a
//! [`SimHardware`]. The network owns a single time-ordered event queue (in
//! global fast-clock ticks) and turns the hardware requests raised by the
//! handlers into future events:
//!
//! - a transmit strobe becomes an SFD rising edge after the turnaround and a
//!   falling edge one frame later, at the sender and at every receiver that
//!   locks onto the frame
//! - identical frames starting within the constructive interference window
//!   merge into one reception; any other overlap either loses against the
//!   locked frame (capture) or corrupts it
//! - edges reach the engine after a randomized interrupt latency, alarms at
//!   the local clock value they were armed for

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use crate::flood::frame::{FOOTER_CORRELATION, FOOTER_CRC_OK, HEADER_LEN};
use crate::flood::{Edge, FastAlarm, FastTicks};
use crate::scheduler::{Phase, ProtocolConfig, SchedulerConfig};

use super::node::{HardwareRequest, RadioMode, Reception, SimNode};
use super::signal_calculations::{
    byte_ticks, calculate_rssi, dbm_to_mw, frame_air_ticks, mw_to_dbm, rssi_register,
};
use super::types::{ConfigUpdate, MediumStats, NetworkEvent, RadioParameters, Scene, SimulationOutcome};

/// Frames this far below the sensitivity neither lock nor interfere.
const INTERFERENCE_FLOOR_DB: f32 = 10.0;

/// Correlation value reported with every reception.
const CORRELATION_VALUE: u8 = 0x6c & FOOTER_CORRELATION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Wake,
    Alarm { alarm: FastAlarm, generation: u64 },
    TxStart { id: u64 },
    TxEnd { id: u64 },
    /// Length and header bytes of a locked frame are in the FIFO.
    RxBytes { reception: u64 },
    RxEnd { reception: u64 },
    Edge { edge: Edge, captured: FastTicks, epoch: u64 },
}

#[derive(Debug)]
struct QueuedEvent {
    at: FastTicks,
    seq: u64,
    node: usize,
    kind: EventKind,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

pub struct Network {
    nodes: Vec<SimNode>,
    sink: usize,
    /// Received power in dBm, `links[from][to]`.
    links: Vec<Vec<f32>>,
    radio: RadioParameters,
    fast_path_budget: FastTicks,
    queue: BinaryHeap<Reverse<QueuedEvent>>,
    seq: u64,
    now: FastTicks,
    rng: StdRng,
    config_updates: VecDeque<ConfigUpdate>,
    next_reception: u64,
    events: Vec<NetworkEvent>,
    stats: MediumStats,
}

impl Network {
    /// Build the nodes and links of `scene` and schedule every node's first wake.
    pub fn new(scene: &Scene, protocol: &ProtocolConfig) -> Result<Self, String> {
        let address_table = scene.report_order();
        protocol.validate(address_table.len())?;
        let scheduler_config = SchedulerConfig {
            timing: protocol.timing.clone(),
            sink_address: scene.sink,
            address_table,
        };

        let nodes: Vec<SimNode> = scene
            .nodes
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                SimNode::new(
                    i,
                    spec.clone(),
                    scheduler_config.clone(),
                    protocol.flood.clone(),
                    scene.mac_config,
                )
            })
            .collect();
        let sink = nodes
            .iter()
            .position(|n| n.address() == scene.sink)
            .ok_or_else(|| format!("Sink {} is not a node of the scene", scene.sink))?;

        let mut rng = StdRng::seed_from_u64(scene.seed);
        let mut links = vec![vec![f32::NEG_INFINITY; nodes.len()]; nodes.len()];
        for (i, from) in nodes.iter().enumerate() {
            for (j, to) in nodes.iter().enumerate() {
                if i == j {
                    continue;
                }
                let distance = from.spec.position.distance(&to.spec.position) as f32;
                links[i][j] = calculate_rssi(distance, from.spec.tx_power, &scene.path_loss_parameters, &mut rng);
                if links[i][j] >= scene.radio.sensitivity_dbm {
                    log::debug!("link {} -> {}: {:.1} dBm", from.address(), to.address(), links[i][j]);
                }
            }
        }

        let mut config_updates: Vec<ConfigUpdate> = scene.config_updates.clone();
        config_updates.sort_by_key(|u| u.round);

        log::info!(
            "Network built: {} nodes, sink {}, {} report phases per round",
            nodes.len(),
            scene.sink,
            scheduler_config.address_table.len()
        );

        let mut network = Self {
            nodes,
            sink,
            links,
            radio: scene.radio.clone(),
            fast_path_budget: protocol.flood.fast_path_latency_budget,
            queue: BinaryHeap::new(),
            seq: 0,
            now: 0,
            rng,
            config_updates: config_updates.into(),
            next_reception: 0,
            events: Vec::new(),
            stats: MediumStats::default(),
        };

        // relays start listening right away, the sink floods once they are
        // well inside their first bootstrap window
        for i in 0..network.nodes.len() {
            let hw = &network.nodes[i].hw;
            let delay = if i == sink { protocol.timing.init_guard_time } else { 1 };
            let at = hw.slow_to_global(hw.local_slow_now() + delay);
            network.schedule(at, i, EventKind::Wake);
        }
        Ok(network)
    }

    pub fn now(&self) -> FastTicks {
        self.now
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node(&self, address: u8) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.address() == address)
    }

    pub fn sink(&self) -> &SimNode {
        &self.nodes[self.sink]
    }

    /// Rounds the sink has completed.
    pub fn sink_rounds(&self) -> u32 {
        self.nodes[self.sink].hooks.rounds()
    }

    pub fn stats(&self) -> MediumStats {
        self.stats
    }

    pub fn next_event_time(&self) -> Option<FastTicks> {
        self.queue.peek().map(|Reverse(e)| e.at)
    }

    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn outcome(&self) -> SimulationOutcome {
        let relays = self.nodes.len() - 1;
        let synced_relays = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| *i != self.sink && !n.scheduler.state().is_bootstrapping())
            .count();
        SimulationOutcome {
            rounds: self.sink_rounds(),
            virtual_time: self.now,
            stats: self.stats,
            synced_relays,
            relays,
        }
    }

    /// Process every event due at or before `deadline`.
    pub fn run_until(&mut self, deadline: FastTicks) {
        while self.next_event_time().is_some_and(|at| at <= deadline) {
            self.step();
        }
    }

    /// Run until the sink completed `rounds` rounds. Returns false if
    /// `deadline` passed first.
    pub fn run_rounds(&mut self, rounds: u32, deadline: FastTicks) -> bool {
        while self.sink_rounds() < rounds {
            match self.next_event_time() {
                Some(at) if at <= deadline => {
                    self.step();
                }
                _ => return false,
            }
        }
        true
    }

    /// Process the earliest event. Returns false if the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(Reverse(event)) = self.queue.pop() else {
            return false;
        };
        self.now = event.at;
        let i = event.node;
        match event.kind {
            EventKind::Wake => self.wake(i),
            EventKind::Alarm { alarm, generation } => self.alarm(i, alarm, generation),
            EventKind::TxStart { id } => self.start_transmission(i, id),
            EventKind::TxEnd { id } => self.end_transmission(i, id),
            EventKind::RxBytes { reception } => self.deliver_head(i, reception),
            EventKind::RxEnd { reception } => self.end_reception(i, reception),
            EventKind::Edge { edge, captured, epoch } => self.frame_boundary(i, edge, captured, epoch),
        }
        true
    }

    fn schedule(&mut self, at: FastTicks, node: usize, kind: EventKind) {
        self.seq += 1;
        self.queue.push(Reverse(QueuedEvent {
            at,
            seq: self.seq,
            node,
            kind,
        }));
    }

    fn schedule_edge(&mut self, node: usize, edge: Edge, captured: FastTicks) {
        let latency = self.radio.irq_latency_base + self.rng.gen_range(0..=self.radio.irq_latency_jitter);
        let epoch = self.nodes[node].hw.epoch();
        self.schedule(captured + latency, node, EventKind::Edge { edge, captured, epoch });
    }

    /// Turn the requests raised by the last handler of node `i` into events.
    fn dispatch(&mut self, i: usize) {
        for request in self.nodes[i].hw.take_requests() {
            match request {
                HardwareRequest::Transmit { id, at } => self.schedule(at, i, EventKind::TxStart { id }),
                HardwareRequest::Alarm { alarm, at, generation } => {
                    self.schedule(at.max(self.now), i, EventKind::Alarm { alarm, generation })
                }
                HardwareRequest::Abort { id } => self.abort_transmission(id),
            }
        }
        let events = self.nodes[i].hooks.take_events();
        self.events.extend(events);
    }

    fn wake(&mut self, i: usize) {
        if i == self.sink {
            self.apply_config_updates();
        }
        let node = &mut self.nodes[i];
        node.hw.prepare(self.now);
        let now = node.hw.local_slow_now();
        let next = node
            .scheduler
            .on_wake(now, &mut node.engine, &mut node.hw, &mut node.hooks);
        let at = node.hw.slow_to_global(next).max(self.now + 1);
        self.schedule(at, i, EventKind::Wake);
        self.dispatch(i);
    }

    /// Hand due configuration updates to the sink before its next round.
    fn apply_config_updates(&mut self) {
        let sink = &mut self.nodes[self.sink];
        if sink.scheduler.phase() != Phase::ConfigFlood {
            return;
        }
        while let Some(update) = self.config_updates.front().copied() {
            if update.round > sink.hooks.rounds() {
                break;
            }
            self.config_updates.pop_front();
            if sink.scheduler.update_configuration(update.config) {
                log::info!(
                    "Sink {} disseminating t_l={} t_s={} n={} from round {}",
                    sink.address(),
                    update.config.t_l,
                    update.config.t_s,
                    update.config.n,
                    sink.hooks.rounds()
                );
            }
        }
    }

    fn alarm(&mut self, i: usize, alarm: FastAlarm, generation: u64) {
        let node = &mut self.nodes[i];
        if !node.hw.alarm_due(alarm, generation) {
            return;
        }
        node.hw.prepare(self.now);
        node.engine.on_alarm(&mut node.hw, alarm);
        self.dispatch(i);
    }

    fn frame_boundary(&mut self, i: usize, edge: Edge, captured: FastTicks, epoch: u64) {
        let budget = self.fast_path_budget;
        let node = &mut self.nodes[i];
        if node.hw.epoch() != epoch {
            log::trace!("node {} dropped stale {:?} edge", node.address(), edge);
            return;
        }
        node.hw.prepare(self.now);
        let captured_local = node.hw.clock().local(captured);
        if edge == Edge::Falling {
            // the fast path pads its latency up to the budget
            node.hw.set_tx_anchor(Some(captured + budget));
        }
        node.engine.on_frame_boundary(&mut node.hw, edge, captured_local);
        node.hw.set_tx_anchor(None);
        self.dispatch(i);
    }

    fn start_transmission(&mut self, i: usize, id: u64) {
        let Some(bytes) = self.nodes[i].hw.start_transmission(id) else {
            return;
        };
        // length byte, FIFO content after it, two FCS bytes
        let end = self.now + frame_air_ticks(bytes.len() + 1);
        self.stats.transmissions += 1;
        self.schedule(end, i, EventKind::TxEnd { id });
        self.schedule_edge(i, Edge::Rising, self.now);
        for j in 0..self.nodes.len() {
            if j != i {
                let power = self.links[i][j];
                self.arrive(j, id, &bytes, power, end);
            }
        }
    }

    fn end_transmission(&mut self, i: usize, id: u64) {
        if self.nodes[i].hw.finish_transmission(id) {
            self.schedule_edge(i, Edge::Falling, self.now);
        }
    }

    /// A transmission cut short can no longer be decoded on its own.
    fn abort_transmission(&mut self, id: u64) {
        for node in &mut self.nodes {
            if let Some(reception) = node.hw.reception_mut() {
                if reception.sources == [id] {
                    reception.corrupted = true;
                }
            }
        }
    }

    /// Frame `source` reaches node `j` with `power` dBm.
    fn arrive(&mut self, j: usize, source: u64, bytes: &[u8], power: f32, end: FastTicks) {
        let now = self.now;
        let radio = &self.radio;
        if power < radio.sensitivity_dbm - INTERFERENCE_FLOOR_DB {
            return;
        }
        let hw = &mut self.nodes[j].hw;
        if hw.mode() != RadioMode::Rx {
            return;
        }
        if let Some(current) = hw.reception_mut() {
            if current.bytes == bytes && now - current.start <= radio.constructive_window_ticks {
                current.sources.push(source);
                current.power_mw += dbm_to_mw(power);
                current.end = current.end.max(end);
                self.stats.constructive += 1;
            } else if mw_to_dbm(current.power_mw) - power >= radio.capture_threshold_db {
                self.stats.captured += 1;
            } else {
                current.corrupted = true;
                self.stats.collisions += 1;
            }
            return;
        }
        if power < radio.sensitivity_dbm {
            return;
        }

        let id = self.next_reception;
        self.next_reception += 1;
        hw.lock(Reception {
            id,
            sources: vec![source],
            start: now,
            end,
            bytes: bytes.to_vec(),
            power_mw: dbm_to_mw(power),
            delivered: 0,
            corrupted: false,
            flushed: false,
        });
        self.schedule_edge(j, Edge::Rising, now);
        self.schedule(now + (HEADER_LEN as FastTicks + 1) * byte_ticks(), j, EventKind::RxBytes { reception: id });
        self.schedule(end, j, EventKind::RxEnd { reception: id });
    }

    fn deliver_head(&mut self, i: usize, reception: u64) {
        let node = &mut self.nodes[i];
        let Some(rx) = node.hw.reception_mut().filter(|r| r.id == reception && !r.flushed) else {
            return;
        };
        let head_len = (HEADER_LEN + 1).min(rx.bytes.len());
        let head = rx.bytes[rx.delivered..head_len].to_vec();
        rx.delivered = head_len;
        node.hw.deliver(&head);
        node.hw.prepare(self.now);
        node.engine.on_byte_ready(&mut node.hw);
        self.dispatch(i);
    }

    fn end_reception(&mut self, i: usize, reception: u64) {
        let end = match self.nodes[i].hw.reception() {
            Some(r) if r.id == reception => r.end,
            _ => return,
        };
        if end > self.now {
            // extended by a constructively interfering frame
            self.schedule(end, i, EventKind::RxEnd { reception });
            return;
        }
        let Some(rx) = self.nodes[i].hw.take_reception(reception) else {
            return;
        };
        if !rx.flushed {
            let p = self.radio.corruption_probability;
            let corrupted = rx.corrupted || (p > 0.0 && self.rng.gen_bool(p));
            let mut tail = rx.bytes[rx.delivered..].to_vec();
            tail.push(rssi_register(mw_to_dbm(rx.power_mw)));
            tail.push(if corrupted {
                CORRELATION_VALUE
            } else {
                FOOTER_CRC_OK | CORRELATION_VALUE
            });
            self.nodes[i].hw.deliver(&tail);
            if corrupted {
                self.stats.corrupted_receptions += 1;
            } else {
                self.stats.receptions += 1;
            }
        }
        self.schedule_edge(i, Edge::Falling, self.now);
    }
}
