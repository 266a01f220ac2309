//! Wire layout of a flood frame.
//!
//! ```text
//! [length][header][payload ...][relay count, sync only][rssi][crc ok | correlation]
//! ```
//!
//! The length field counts every byte after itself, including the two footer
//! bytes the transceiver appends on transmission and rewrites on reception
//! (RSSI and CRC status). The local buffer therefore holds `packet_len + 1`
//! bytes, of which `packet_len - 1` are handed to the transmit FIFO.

/// Fixed sentinel carried in the second byte of every flood frame.
pub const FLOOD_HEADER: u8 = 0xfe;
/// Header field length in bytes.
pub const HEADER_LEN: usize = 1;
/// Footer appended by the transceiver (FCS on air, RSSI + CRC status in the RX FIFO).
pub const FOOTER_LEN: usize = 2;
/// Relay counter trailer length, present only in synchronized sessions.
pub const RELAY_COUNT_LEN: usize = 1;
/// CRC-ok flag in the last footer byte.
pub const FOOTER_CRC_OK: u8 = 0x80;
/// Correlation value bits in the last footer byte.
pub const FOOTER_CORRELATION: u8 = 0x7f;
/// Largest value the length field may take (IEEE 802.15.4 aMaxPHYPacketSize).
pub const MAX_PACKET_LEN: usize = 127;

/// Largest application payload for a session with the given sync flag.
pub const fn max_payload_len(sync_enabled: bool) -> usize {
    MAX_PACKET_LEN - HEADER_LEN - FOOTER_LEN - if sync_enabled { RELAY_COUNT_LEN } else { 0 }
}

/// Value of the length field for a payload of `payload_len` bytes.
pub const fn packet_len(payload_len: usize, sync_enabled: bool) -> usize {
    payload_len + HEADER_LEN + FOOTER_LEN + if sync_enabled { RELAY_COUNT_LEN } else { 0 }
}

/// Owned frame buffer with typed accessors for each field.
///
/// Byte 0 is the length field, byte 1 the header; the relay count (if any)
/// sits right before the footer.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Vec<u8>,
    payload_len: usize,
    sync_enabled: bool,
}

impl Frame {
    /// Wrap an already reserved buffer. The buffer is resized to `packet_len + 1`
    /// and the length and header fields are written.
    pub(crate) fn from_buffer(mut bytes: Vec<u8>, payload_len: usize, sync_enabled: bool) -> Self {
        let packet_len = packet_len(payload_len, sync_enabled);
        bytes.clear();
        bytes.resize(packet_len + 1, 0);
        let mut frame = Self {
            bytes,
            payload_len,
            sync_enabled,
        };
        frame.reset_fields();
        frame
    }

    /// Rewrite the length and header fields to their expected values.
    pub fn reset_fields(&mut self) {
        self.bytes[0] = self.packet_len() as u8;
        self.bytes[1] = FLOOD_HEADER;
    }

    pub fn packet_len(&self) -> usize {
        packet_len(self.payload_len, self.sync_enabled)
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn length_field(&self) -> u8 {
        self.bytes[0]
    }

    pub fn header_field(&self) -> u8 {
        self.bytes[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN + 1..HEADER_LEN + 1 + self.payload_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = HEADER_LEN + 1;
        &mut self.bytes[start..start + self.payload_len]
    }

    fn relay_index(&self) -> Option<usize> {
        self.sync_enabled.then(|| self.packet_len() - FOOTER_LEN)
    }

    /// Relay counter, or 0 for unsynchronized frames.
    pub fn relay_count(&self) -> u8 {
        self.relay_index().map(|idx| self.bytes[idx]).unwrap_or(0)
    }

    pub fn set_relay_count(&mut self, relay_count: u8) {
        if let Some(idx) = self.relay_index() {
            self.bytes[idx] = relay_count;
        }
    }

    /// Increment the relay counter in place (wrapping, as the on-air field is one byte).
    pub fn increment_relay_count(&mut self) {
        if let Some(idx) = self.relay_index() {
            self.bytes[idx] = self.bytes[idx].wrapping_add(1);
        }
    }

    /// RSSI byte written by the transceiver on reception.
    pub fn rssi(&self) -> i8 {
        self.bytes[self.packet_len() - 1] as i8
    }

    /// CRC status of the last reception, as reported in the footer.
    pub fn crc_ok(&self) -> bool {
        self.bytes[self.packet_len()] & FOOTER_CRC_OK != 0
    }

    /// Bytes handed to the transmit FIFO; the transceiver appends the footer.
    pub fn tx_bytes(&self) -> &[u8] {
        &self.bytes[..self.packet_len() - 1]
    }

    /// Store a received byte at `index` (0 is the length field).
    pub(crate) fn store(&mut self, index: usize, byte: u8) {
        self.bytes[index] = byte;
    }

    /// Total bytes expected from the RX FIFO for one frame: length field plus `packet_len`.
    pub(crate) fn rx_len(&self) -> usize {
        self.packet_len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_len_accounts_for_header_footer_and_relay_field() {
        assert_eq!(packet_len(6, true), 10);
        assert_eq!(packet_len(6, false), 9);
        assert_eq!(packet_len(max_payload_len(true), true), MAX_PACKET_LEN);
        assert_eq!(packet_len(max_payload_len(false), false), MAX_PACKET_LEN);
    }

    #[test]
    fn fields_sit_at_their_documented_offsets() {
        let mut frame = Frame::from_buffer(Vec::new(), 3, true);
        frame.payload_mut().copy_from_slice(&[0xaa, 0xbb, 0xcc]);
        frame.set_relay_count(4);

        assert_eq!(frame.tx_bytes(), &[7, FLOOD_HEADER, 0xaa, 0xbb, 0xcc, 4]);
        assert_eq!(frame.rx_len(), 8);

        frame.increment_relay_count();
        assert_eq!(frame.relay_count(), 5);
    }

    #[test]
    fn unsynchronized_frames_have_no_relay_field() {
        let mut frame = Frame::from_buffer(Vec::new(), 2, false);
        frame.payload_mut().copy_from_slice(&[1, 2]);
        frame.set_relay_count(9);
        frame.increment_relay_count();

        assert_eq!(frame.relay_count(), 0);
        assert_eq!(frame.tx_bytes(), &[5, FLOOD_HEADER, 1, 2]);
    }

    #[test]
    fn footer_reports_crc_and_rssi() {
        let mut frame = Frame::from_buffer(Vec::new(), 1, false);
        let len = frame.packet_len();
        frame.store(len - 1, (-42i8) as u8);
        frame.store(len, FOOTER_CRC_OK | 0x6c);
        assert!(frame.crc_ok());
        assert_eq!(frame.rssi(), -42);

        frame.store(len, 0x6c);
        assert!(!frame.crc_ok());
    }
}
