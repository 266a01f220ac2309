//! Narrow hardware interfaces consumed by the flood engine.
//!
//! The engine never talks to a transceiver or timer peripheral directly; a
//! platform (real board or the simulator) implements these traits and invokes
//! the engine's handlers from its frame-boundary and alarm interrupts.

/// Fast-clock tick count (DCO / high-frequency timer).
pub type FastTicks = u64;
/// Low-frequency clock tick count (32 kHz crystal).
pub type SlowTicks = u64;

/// Transceiver primitives.
pub trait Radio {
    /// Discard everything in the receive FIFO, including a frame in progress.
    fn flush_rx(&mut self);
    /// Discard the transmit FIFO.
    fn flush_tx(&mut self);
    /// Enter receive mode. Cancels a transmission that has been started but
    /// not yet reached its start-of-frame delimiter.
    fn power_on(&mut self);
    /// Power the transceiver down, cancelling any pending transmission.
    fn power_off(&mut self);
    /// Start transmitting the TX FIFO content after the fixed turnaround.
    fn begin_transmit(&mut self);
    /// Load bytes into the transmit FIFO.
    fn write_tx(&mut self, bytes: &[u8]);
    /// Non-blocking FIFO read.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Fast-clock alarms owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastAlarm {
    /// Byte-level receive timeout for the frame in progress.
    RxTimeout,
    /// Initiator retransmission when nothing has been heard.
    InitiatorTimeout,
}

impl FastAlarm {
    pub const ALL: [FastAlarm; 2] = [FastAlarm::RxTimeout, FastAlarm::InitiatorTimeout];

    pub fn index(self) -> usize {
        match self {
            FastAlarm::RxTimeout => 0,
            FastAlarm::InitiatorTimeout => 1,
        }
    }
}

/// Fast clock, its alarms, and the capture unit linking it to the slow clock.
pub trait FastTimer {
    fn now(&self) -> FastTicks;
    fn set_alarm(&mut self, alarm: FastAlarm, at: FastTicks);
    fn clear_alarm(&mut self, alarm: FastAlarm);
    /// Wait for the next low-frequency tick edge and return both clocks sampled on it.
    fn capture_next_slow_tick(&mut self) -> (FastTicks, SlowTicks);
}

/// Everything a flood needs from the platform.
pub trait FloodHardware: Radio + FastTimer {}

impl<T: Radio + FastTimer> FloodHardware for T {}

/// Masking of the peripheral interrupts unrelated to flooding.
///
/// Register access is global on the target, hence `&self`.
pub trait InterruptMask {
    /// Saved enable state handed back on restore.
    type Token;

    /// Save and disable every maskable interrupt except the frame-boundary capture.
    fn suppress_others(&self) -> Self::Token;
    /// Re-enable what `suppress_others` disabled.
    fn restore_others(&self, token: Self::Token);
}

/// Scoped bracket around a flood: other interrupts stay masked for as long as
/// the guard lives and are restored when it is dropped.
pub struct InterruptMaskGuard<M: InterruptMask> {
    mask: M,
    token: Option<M::Token>,
}

impl<M: InterruptMask> InterruptMaskGuard<M> {
    pub fn acquire(mask: M) -> Self {
        let token = mask.suppress_others();
        Self { mask, token: Some(token) }
    }

    /// Restore now instead of at drop.
    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if let Some(token) = self.token.take() {
            self.mask.restore_others(token);
        }
    }
}

impl<M: InterruptMask> Drop for InterruptMaskGuard<M> {
    fn drop(&mut self) {
        self.restore();
    }
}
