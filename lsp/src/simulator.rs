//! Packet-loss fault injection.
//!
//! Real networks drop packets.  To exercise retransmission and liveness
//! detection without depending on actual network conditions, every
//! [`crate::socket::Socket`] carries a [`LossConfig`] and consults it on both
//! paths:
//!
//! | Path  | Field                | Effect                                  |
//! |-------|----------------------|-----------------------------------------|
//! | Read  | `read_drop_percent`  | Received datagram discarded unseen.     |
//! | Write | `write_drop_percent` | Send reported successful, never issued. |
//!
//! Only loss is modelled; no duplication, reordering or corruption.  Each
//! decision is an independent uniform draw.

use rand::Rng;

/// Independent per-packet drop probabilities, in whole percent (`0..=100`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossConfig {
    pub read_drop_percent: u8,
    pub write_drop_percent: u8,
}

impl LossConfig {
    /// Lossless pass-through.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(read_drop_percent: u8, write_drop_percent: u8) -> Self {
        Self {
            read_drop_percent,
            write_drop_percent,
        }
    }

    /// `true` if both percentages are within `0..=100`.
    pub fn is_valid(&self) -> bool {
        self.read_drop_percent <= 100 && self.write_drop_percent <= 100
    }

    pub fn drop_read(&self) -> bool {
        should_drop(self.read_drop_percent)
    }

    pub fn drop_write(&self) -> bool {
        should_drop(self.write_drop_percent)
    }
}

/// Draw once: `true` with probability `percent / 100`.
pub fn should_drop(percent: u8) -> bool {
    match percent {
        0 => false,
        p if p >= 100 => true,
        p => rand::thread_rng().gen_range(0..100u8) < p,
    }
}
