//! Constructive-interference flood state machine.
//!
//! A flood is driven entirely by interrupts: the platform calls
//! [`FloodEngine::on_frame_boundary`] on every SFD edge (rising at the start
//! of a frame, falling at its end, for received and transmitted frames
//! alike), [`FloodEngine::on_byte_ready`] when the RX FIFO fills, and
//! [`FloodEngine::on_alarm`] when one of the fast-clock alarms expires. The
//! caller only acts before [`FloodEngine::start`] and after
//! [`FloodEngine::stop`].

use std::fmt;

use serde::Deserialize;

use super::frame::{FLOOD_HEADER, Frame, HEADER_LEN, max_payload_len, packet_len};
use super::hardware::{FastAlarm, FastTicks, FloodHardware};
use crate::sync_clock::{DEFAULT_CLOCK_RATIO, DEFAULT_SYNC_WINDOW, HopTimestamps, SyncClock};

/// Fast-clock frequency of the reference platform (DCO, Hz).
pub const FAST_CLOCK_HZ: u64 = 4_194_304;
/// Relay counts at or above this value carry no usable timing information.
/// Also written into frames an initiator retransmits after its timeout.
pub const TOO_DEEP_RELAY_COUNT: u8 = 200;
/// Fixed slack of the byte-level receive timeout, in slow-clock ticks.
pub const RX_TIMEOUT_MARGIN: u64 = 5;
/// Per-byte receive timeout as the fraction 135/128 of a slow-clock tick.
pub const RX_TIMEOUT_BYTE_NUM: u64 = 135;
pub const RX_TIMEOUT_BYTE_DEN: u64 = 128;
/// Frames longer than this are partially read at the rising edge.
const EARLY_READ_THRESHOLD: usize = 8;
/// Bytes left in the FIFO for the falling edge handler when reading early.
const LATE_READ_BYTES: usize = 7;
/// Retransmission count bounds accepted by [`FloodEngine::start`].
pub const MAX_RETRANSMISSIONS: u8 = 16;

/// Platform calibration and protocol constants of the engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    /// Largest edge-to-handler latency (fast ticks) for which the retransmission
    /// still starts inside the falling-edge handler.
    pub fast_path_latency_budget: FastTicks,
    /// Delay before an initiator that heard nothing transmits again.
    pub initiator_timeout: FastTicks,
    pub too_deep_relay_count: u8,
    /// Samples averaged into the slot estimate.
    pub sync_window: u32,
    /// Fast ticks per slow tick.
    pub clock_ratio: u64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            fast_path_latency_budget: 8,
            initiator_timeout: FAST_CLOCK_HZ / 400,
            too_deep_relay_count: TOO_DEEP_RELAY_COUNT,
            sync_window: DEFAULT_SYNC_WINDOW,
            clock_ratio: DEFAULT_CLOCK_RATIO,
        }
    }
}

impl FloodConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initiator_timeout == 0 {
            return Err("flood.initiator_timeout must be positive".into());
        }
        if self.clock_ratio == 0 {
            return Err("flood.clock_ratio must be at least 1".into());
        }
        if self.sync_window == 0 {
            return Err("flood.sync_window must be at least 1".into());
        }
        if self.too_deep_relay_count == 0 {
            return Err("flood.too_deep_relay_count must be positive".into());
        }
        Ok(())
    }
}

/// Frame-boundary (SFD) edge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Start-of-frame delimiter seen (RX) or sent (TX).
    Rising,
    /// Last byte of the frame received or sent.
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloodStatus {
    #[default]
    Off,
    Waiting,
    Receiving,
    Received,
    Transmitting,
    Transmitted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodError {
    /// The frame buffer could not be reserved.
    FrameAllocation,
    PayloadLength { len: usize, max: usize },
    RetransmissionLimit(u8),
    /// `start` called while a previous session has not been stopped.
    SessionActive,
}

impl fmt::Display for FloodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloodError::FrameAllocation => write!(f, "failed to allocate flood frame buffer"),
            FloodError::PayloadLength { len, max } => {
                write!(f, "payload length {} out of range (1..={})", len, max)
            }
            FloodError::RetransmissionLimit(n) => {
                write!(f, "max retransmissions {} out of range (1..={})", n, MAX_RETRANSMISSIONS)
            }
            FloodError::SessionActive => write!(f, "a flood session is already active"),
        }
    }
}

impl std::error::Error for FloodError {}

/// Parameters of one flood.
///
/// Receivers pass a buffer of the expected payload length; its content is
/// ignored and the received payload is returned by [`FloodEngine::stop`].
#[derive(Debug, Clone, Copy)]
pub struct FloodRequest<'a> {
    pub payload: &'a [u8],
    pub is_initiator: bool,
    pub sync_enabled: bool,
    pub max_retransmissions: u8,
    /// False when the caller already arranged radio power (e.g. already listening).
    pub turn_radio_on: bool,
}

impl<'a> FloodRequest<'a> {
    pub fn initiator(payload: &'a [u8], sync_enabled: bool, max_retransmissions: u8) -> Self {
        Self {
            payload,
            is_initiator: true,
            sync_enabled,
            max_retransmissions,
            turn_radio_on: true,
        }
    }

    pub fn receiver(buffer: &'a [u8], sync_enabled: bool, max_retransmissions: u8) -> Self {
        Self {
            payload: buffer,
            is_initiator: false,
            sync_enabled,
            max_retransmissions,
            turn_radio_on: true,
        }
    }
}

/// Proof of an active session. Not cloneable: `stop` consumes it.
#[derive(Debug)]
pub struct SessionHandle {
    id: u32,
}

/// Result of a stopped flood.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodOutcome {
    /// Distinct successful receptions during the session.
    pub reception_count: u8,
    /// The initiator's payload, or what the receiver recovered (unchanged
    /// input buffer if nothing was received).
    pub payload: Vec<u8>,
}

struct FloodSession {
    id: u32,
    frame: Frame,
    payload: Vec<u8>,
    is_initiator: bool,
    sync_enabled: bool,
    max_retransmissions: u8,
    rx_count: u8,
    tx_count: u8,
    bytes_read: usize,
    tx_relay_last: u8,
    rx_start: FastTicks,
    rx_stop: FastTicks,
    tx_start: FastTicks,
    tx_stop: FastTicks,
    first_rx: FastTicks,
    listen_start: Option<FastTicks>,
}

impl FloodSession {
    fn early_read_limit(&self) -> usize {
        let packet_len = self.frame.packet_len();
        if packet_len > EARLY_READ_THRESHOLD {
            packet_len - LATE_READ_BYTES
        } else {
            HEADER_LEN + 1
        }
    }
}

/// Receive timeout for a frame of `packet_len` bytes, in fast ticks.
pub fn rx_timeout_ticks(packet_len: usize, clock_ratio: u64) -> FastTicks {
    (RX_TIMEOUT_MARGIN + packet_len as u64 * RX_TIMEOUT_BYTE_NUM / RX_TIMEOUT_BYTE_DEN) * clock_ratio
}

pub struct FloodEngine {
    config: FloodConfig,
    status: FloodStatus,
    sync_clock: SyncClock,
    session: Option<FloodSession>,
    next_session_id: u32,
    time_to_first_rx: Option<FastTicks>,
}

impl FloodEngine {
    pub fn new(config: FloodConfig) -> Self {
        let sync_clock = SyncClock::new(config.sync_window, config.clock_ratio);
        Self {
            config,
            status: FloodStatus::Off,
            sync_clock,
            session: None,
            next_session_id: 0,
            time_to_first_rx: None,
        }
    }

    pub fn config(&self) -> &FloodConfig {
        &self.config
    }

    pub fn status(&self) -> FloodStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn sync_clock(&self) -> &SyncClock {
        &self.sync_clock
    }

    pub fn sync_clock_mut(&mut self) -> &mut SyncClock {
        &mut self.sync_clock
    }

    /// Receptions so far in the active session.
    pub fn reception_count(&self) -> u8 {
        self.session.as_ref().map(|s| s.rx_count).unwrap_or(0)
    }

    /// Fast ticks from switching the receiver on to the first synchronized
    /// reception, measured in the most recent session that had one.
    pub fn time_to_first_rx(&self) -> Option<FastTicks> {
        self.time_to_first_rx
    }

    /// Build the frame and seed the state machine.
    ///
    /// Fails without touching the radio when the request is invalid or the
    /// frame buffer cannot be reserved.
    pub fn start(&mut self, hw: &mut impl FloodHardware, request: FloodRequest<'_>) -> Result<SessionHandle, FloodError> {
        if self.session.is_some() {
            return Err(FloodError::SessionActive);
        }
        let max = max_payload_len(request.sync_enabled);
        if request.payload.is_empty() || request.payload.len() > max {
            return Err(FloodError::PayloadLength {
                len: request.payload.len(),
                max,
            });
        }
        if request.max_retransmissions == 0 || request.max_retransmissions > MAX_RETRANSMISSIONS {
            return Err(FloodError::RetransmissionLimit(request.max_retransmissions));
        }

        let payload_len = request.payload.len();
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(packet_len(payload_len, request.sync_enabled) + 1)
            .map_err(|_| FloodError::FrameAllocation)?;
        let mut payload = Vec::new();
        payload.try_reserve_exact(payload_len).map_err(|_| FloodError::FrameAllocation)?;
        payload.extend_from_slice(request.payload);

        let mut frame = Frame::from_buffer(buffer, payload_len, request.sync_enabled);
        if request.is_initiator {
            frame.payload_mut().copy_from_slice(&payload);
            self.status = FloodStatus::Received;
        } else {
            self.status = FloodStatus::Waiting;
        }
        if request.sync_enabled {
            frame.set_relay_count(0);
            if request.turn_radio_on {
                self.sync_clock.clear_updated();
            }
        }

        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        let mut session = FloodSession {
            id,
            frame,
            payload,
            is_initiator: request.is_initiator,
            sync_enabled: request.sync_enabled,
            max_retransmissions: request.max_retransmissions,
            rx_count: 0,
            tx_count: 0,
            bytes_read: 0,
            tx_relay_last: 0,
            rx_start: 0,
            rx_stop: 0,
            tx_start: 0,
            tx_stop: 0,
            first_rx: 0,
            listen_start: None,
        };

        hw.flush_rx();
        hw.flush_tx();
        if request.is_initiator {
            hw.write_tx(session.frame.tx_bytes());
            if request.turn_radio_on {
                hw.begin_transmit();
                let at = hw.now() + self.config.initiator_timeout;
                hw.set_alarm(FastAlarm::InitiatorTimeout, at);
            }
        } else if request.turn_radio_on {
            if request.sync_enabled {
                session.listen_start = Some(hw.now());
            }
            hw.power_on();
        }
        log::trace!(
            "flood {} started: initiator={} sync={} len={} n={}",
            id,
            request.is_initiator,
            request.sync_enabled,
            payload_len,
            request.max_retransmissions
        );

        self.session = Some(session);
        Ok(SessionHandle { id })
    }

    /// Power the radio down and release the session. Safe in every status.
    pub fn stop(&mut self, hw: &mut impl FloodHardware, handle: SessionHandle) -> FloodOutcome {
        for alarm in FastAlarm::ALL {
            hw.clear_alarm(alarm);
        }
        hw.power_off();
        hw.flush_rx();
        hw.flush_tx();
        self.status = FloodStatus::Off;

        match self.session.take() {
            Some(session) => {
                if session.id != handle.id {
                    log::warn!("flood {} stopped with handle of flood {}", session.id, handle.id);
                }
                log::trace!(
                    "flood {} stopped: rx={} tx={}",
                    session.id,
                    session.rx_count,
                    session.tx_count
                );
                FloodOutcome {
                    reception_count: session.rx_count,
                    payload: session.payload,
                }
            }
            None => FloodOutcome::default(),
        }
    }

    /// SFD edge handler. `captured_at` is the fast-clock value latched by the
    /// capture unit on the edge itself.
    pub fn on_frame_boundary(&mut self, hw: &mut impl FloodHardware, edge: Edge, captured_at: FastTicks) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match (self.status, edge) {
            (FloodStatus::Off, _) => {}
            (FloodStatus::Receiving, Edge::Falling) => {
                let latency = hw.now().saturating_sub(captured_at);
                if latency <= self.config.fast_path_latency_budget {
                    // retransmission must start before anything else runs
                    hw.begin_transmit();
                    self.end_rx(&mut session, hw, captured_at);
                } else {
                    log::trace!("fast path missed by {} ticks", latency - self.config.fast_path_latency_budget);
                    hw.flush_rx();
                    hw.clear_alarm(FastAlarm::RxTimeout);
                    self.status = FloodStatus::Waiting;
                }
            }
            (FloodStatus::Waiting, Edge::Rising) => self.begin_rx(&mut session, hw, captured_at),
            (FloodStatus::Received, Edge::Rising) => self.begin_tx(&mut session, hw, captured_at),
            (FloodStatus::Transmitting, Edge::Falling) => self.end_tx(&mut session, hw, captured_at),
            (FloodStatus::Aborted, _) => self.status = FloodStatus::Waiting,
            _ => {
                hw.flush_rx();
                self.status = FloodStatus::Waiting;
            }
        }
        self.session = Some(session);
    }

    /// RX FIFO threshold handler: continues the early read of a frame in progress.
    pub fn on_byte_ready(&mut self, hw: &mut impl FloodHardware) {
        if self.status != FloodStatus::Receiving {
            return;
        }
        if let Some(mut session) = self.session.take() {
            self.read_early(&mut session, hw);
            self.session = Some(session);
        }
    }

    pub fn on_alarm(&mut self, hw: &mut impl FloodHardware, alarm: FastAlarm) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match alarm {
            FastAlarm::RxTimeout => {
                if self.status == FloodStatus::Receiving {
                    log::trace!("rx timeout after {} bytes", session.bytes_read);
                    hw.flush_rx();
                    self.status = FloodStatus::Waiting;
                }
            }
            FastAlarm::InitiatorTimeout => self.initiator_timeout(&mut session, hw),
        }
        self.session = Some(session);
    }

    fn initiator_timeout(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware) {
        if !session.is_initiator {
            return;
        }
        if session.rx_count > 0 {
            hw.clear_alarm(FastAlarm::InitiatorTimeout);
            return;
        }
        if self.status == FloodStatus::Waiting {
            log::trace!("initiator timeout, transmitting again");
            session.tx_count = 0;
            session.frame.reset_fields();
            if session.sync_enabled {
                session.frame.set_relay_count(self.config.too_deep_relay_count);
            }
            session.frame.payload_mut().copy_from_slice(&session.payload);
            self.status = FloodStatus::Received;
            hw.write_tx(session.frame.tx_bytes());
            hw.begin_transmit();
        }
        let at = hw.now() + self.config.initiator_timeout;
        hw.set_alarm(FastAlarm::InitiatorTimeout, at);
    }

    fn begin_rx(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware, captured_at: FastTicks) {
        session.rx_start = captured_at;
        if session.sync_enabled && session.rx_count == 0 {
            session.first_rx = hw.now();
        }
        self.status = FloodStatus::Receiving;
        session.bytes_read = 0;
        let timeout = rx_timeout_ticks(session.frame.packet_len(), self.config.clock_ratio);
        hw.set_alarm(FastAlarm::RxTimeout, hw.now() + timeout);
        self.read_early(session, hw);
    }

    /// Read the length and header fields (and, for long frames, everything
    /// but the tail) as soon as the bytes arrive, aborting on a mismatch.
    fn read_early(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware) {
        let limit = session.early_read_limit();
        while self.status == FloodStatus::Receiving && session.bytes_read < limit {
            let Some(byte) = hw.read_byte() else {
                break;
            };
            session.frame.store(session.bytes_read, byte);
            session.bytes_read += 1;
            let mismatch = match session.bytes_read {
                1 => byte as usize != session.frame.packet_len(),
                2 => byte != FLOOD_HEADER,
                _ => false,
            };
            if mismatch {
                log::trace!("abort rx: unexpected byte {:#04x} at offset {}", byte, session.bytes_read - 1);
                self.abort_rx(hw);
            }
        }
    }

    fn abort_rx(&mut self, hw: &mut impl FloodHardware) {
        if self.status == FloodStatus::Receiving {
            self.status = FloodStatus::Aborted;
            hw.flush_rx();
        }
        hw.clear_alarm(FastAlarm::RxTimeout);
    }

    fn end_rx(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware, rx_stop: FastTicks) {
        let rx_len = session.frame.rx_len();
        let mut complete = true;
        while session.bytes_read < rx_len {
            match hw.read_byte() {
                Some(byte) => session.frame.store(session.bytes_read, byte),
                None => complete = false,
            }
            session.bytes_read += 1;
        }

        let frame = &session.frame;
        let accepted = complete
            && frame.crc_ok()
            && frame.header_field() == FLOOD_HEADER
            && frame.length_field() as usize == frame.packet_len();
        if accepted {
            if session.sync_enabled {
                session.frame.increment_relay_count();
            }
            if session.tx_count == session.max_retransmissions {
                hw.power_off();
                self.status = FloodStatus::Off;
            } else {
                hw.write_tx(session.frame.tx_bytes());
                self.status = FloodStatus::Received;
            }
            if session.sync_enabled && session.rx_count == 0 {
                if let Some(listen_start) = session.listen_start {
                    self.time_to_first_rx = Some(session.first_rx.saturating_sub(listen_start));
                }
            }
            session.rx_count = session.rx_count.saturating_add(1);
            let relay_count = session.frame.relay_count();
            if session.sync_enabled && relay_count < self.config.too_deep_relay_count {
                let hop = HopTimestamps {
                    previous_rx_stop: session.rx_stop,
                    tx_start: session.tx_start,
                    tx_stop: session.tx_stop,
                    rx_start: session.rx_start,
                };
                self.sync_clock
                    .estimate_slot_lengths(session.rx_count, relay_count, session.tx_relay_last, &hop, rx_stop);
            }
            session.rx_stop = rx_stop;
            if session.is_initiator {
                hw.clear_alarm(FastAlarm::InitiatorTimeout);
            }
            log::trace!("rx ok: count={} relay={}", session.rx_count, relay_count);
        } else {
            log::trace!("rx corrupted, returning to listen");
            // back to RX cancels the transmission started by the fast path
            hw.power_on();
            hw.flush_rx();
            self.status = FloodStatus::Waiting;
        }
        hw.clear_alarm(FastAlarm::RxTimeout);
    }

    fn begin_tx(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware, captured_at: FastTicks) {
        session.tx_start = captured_at;
        self.status = FloodStatus::Transmitting;
        let relay_count = session.frame.relay_count();
        session.tx_relay_last = relay_count;
        if !session.is_initiator && session.rx_count == 1 {
            session.payload.copy_from_slice(session.frame.payload());
        }
        if session.sync_enabled
            && self.sync_clock.slot_duration() > 0
            && !self.sync_clock.is_updated()
            && session.rx_count > 0
            && relay_count < self.config.too_deep_relay_count
        {
            let capture = hw.capture_next_slow_tick();
            self.sync_clock
                .compute_sync_reference_point(relay_count, session.rx_start, capture);
        }
    }

    fn end_tx(&mut self, session: &mut FloodSession, hw: &mut impl FloodHardware, captured_at: FastTicks) {
        session.tx_stop = captured_at;
        session.tx_count = session.tx_count.saturating_add(1);
        let initiator_done = session.max_retransmissions > u8::from(session.is_initiator);
        if session.tx_count == session.max_retransmissions && (!session.sync_enabled || initiator_done) {
            hw.power_off();
            self.status = FloodStatus::Off;
        } else {
            self.status = FloodStatus::Waiting;
        }
        hw.flush_tx();
    }
}
