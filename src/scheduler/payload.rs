//! Little-endian payload layouts carried by config and report floods.

use serde::Deserialize;
use std::fmt;

pub const CONFIG_PAYLOAD_LEN: usize = 6;
pub const REPORT_PAYLOAD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    Length { expected: usize, actual: usize },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Length { expected, actual } => {
                write!(f, "payload has {} bytes, expected {}", actual, expected)
            }
        }
    }
}

impl std::error::Error for PayloadError {}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), PayloadError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(PayloadError::Length {
            expected,
            actual: bytes.len(),
        })
    }
}

/// Duty-cycle parameters handed to the adaptation layer; opaque to the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MacConfiguration {
    /// Listen time in slow-clock ticks.
    pub t_l: u16,
    /// Sleep time in slow-clock ticks.
    pub t_s: u16,
    /// Maximum retransmissions.
    pub n: u8,
}

/// Configuration flood payload: `t_l:u16, t_s:u16, n:u8, seq_no:u8`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigPayload {
    pub config: MacConfiguration,
    pub sequence_number: u8,
}

impl ConfigPayload {
    pub fn to_bytes(&self) -> [u8; CONFIG_PAYLOAD_LEN] {
        let mut out = [0u8; CONFIG_PAYLOAD_LEN];
        out[0..2].copy_from_slice(&self.config.t_l.to_le_bytes());
        out[2..4].copy_from_slice(&self.config.t_s.to_le_bytes());
        out[4] = self.config.n;
        out[5] = self.sequence_number;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        check_len(bytes, CONFIG_PAYLOAD_LEN)?;
        Ok(Self {
            config: MacConfiguration {
                t_l: u16::from_le_bytes([bytes[0], bytes[1]]),
                t_s: u16::from_le_bytes([bytes[2], bytes[3]]),
                n: bytes[4],
            },
            sequence_number: bytes[5],
        })
    }
}

/// Report flood payload: `pkt_rate:u16, prr:u16, node_id:u8, parent_id:u8`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub pkt_rate: u16,
    /// Packet reception ratio in per mille.
    pub prr: u16,
    pub node_id: u8,
    /// 0 while the node has no parent.
    pub parent_id: u8,
}

impl NodeReport {
    pub fn to_bytes(&self) -> [u8; REPORT_PAYLOAD_LEN] {
        let mut out = [0u8; REPORT_PAYLOAD_LEN];
        out[0..2].copy_from_slice(&self.pkt_rate.to_le_bytes());
        out[2..4].copy_from_slice(&self.prr.to_le_bytes());
        out[4] = self.node_id;
        out[5] = self.parent_id;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        check_len(bytes, REPORT_PAYLOAD_LEN)?;
        Ok(Self {
            pkt_rate: u16::from_le_bytes([bytes[0], bytes[1]]),
            prr: u16::from_le_bytes([bytes[2], bytes[3]]),
            node_id: bytes[4],
            parent_id: bytes[5],
        })
    }
}

/// Slow-clock ticks to milliseconds, rounded half up.
pub fn slow_ticks_to_ms(ticks: u16) -> u32 {
    let tenths = ticks as u32 * 10_000 / super::config::SLOW_CLOCK_HZ as u32;
    if tenths % 10 > 4 { tenths / 10 + 1 } else { tenths / 10 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_layout_is_little_endian() {
        let payload = ConfigPayload {
            config: MacConfiguration {
                t_l: 0x0102,
                t_s: 0x0a0b,
                n: 4,
            },
            sequence_number: 9,
        };
        assert_eq!(payload.to_bytes(), [0x02, 0x01, 0x0b, 0x0a, 4, 9]);
        assert_eq!(ConfigPayload::from_bytes(&payload.to_bytes()), Ok(payload));
    }

    #[test]
    fn report_layout_is_little_endian() {
        let bytes = [0x10, 0x00, 0xe8, 0x03, 12, 5];
        let report = NodeReport::from_bytes(&bytes).expect("decode");
        assert_eq!(report.pkt_rate, 16);
        assert_eq!(report.prr, 1000);
        assert_eq!(report.node_id, 12);
        assert_eq!(report.parent_id, 5);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            NodeReport::from_bytes(&[1, 2, 3]),
            Err(PayloadError::Length {
                expected: REPORT_PAYLOAD_LEN,
                actual: 3
            })
        );
    }

    #[test]
    fn tick_conversion_rounds_to_nearest_ms() {
        assert_eq!(slow_ticks_to_ms(328), 10);
        assert_eq!(slow_ticks_to_ms(3277), 100);
        assert_eq!(slow_ticks_to_ms(16), 0);
        assert_eq!(slow_ticks_to_ms(17), 1);
    }
}
