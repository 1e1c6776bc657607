//! Engine configuration.

use std::time::Duration;

use log::LevelFilter;

use crate::error::LspError;
use crate::simulator::LossConfig;

pub const DEFAULT_EPOCH_LIMIT: u32 = 5;
pub const DEFAULT_EPOCH_MILLIS: u64 = 2000;

/// Parameters shared by the client and server engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Epochs of silence tolerated before a peer is declared dead.
    pub epoch_limit: u32,
    /// Interval between epoch ticks.
    pub epoch_duration: Duration,
    /// Fault injection applied to the engine's socket.
    pub loss: LossConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch_limit: DEFAULT_EPOCH_LIMIT,
            epoch_duration: Duration::from_millis(DEFAULT_EPOCH_MILLIS),
            loss: LossConfig::none(),
        }
    }
}

impl Config {
    pub fn new(epoch_limit: u32, epoch_millis: u64) -> Self {
        Self {
            epoch_limit,
            epoch_duration: Duration::from_millis(epoch_millis),
            loss: LossConfig::none(),
        }
    }

    pub fn with_loss(mut self, loss: LossConfig) -> Self {
        self.loss = loss;
        self
    }

    pub fn validate(&self) -> Result<(), LspError> {
        if self.epoch_limit == 0 {
            return Err(LspError::InvalidConfig("epoch limit must be positive".into()));
        }
        if self.epoch_duration.is_zero() {
            return Err(LspError::InvalidConfig(
                "epoch duration must be positive".into(),
            ));
        }
        if !self.loss.is_valid() {
            return Err(LspError::InvalidConfig(format!(
                "drop percentages must be within 0..=100 (read {}, write {})",
                self.loss.read_drop_percent, self.loss.write_drop_percent
            )));
        }
        Ok(())
    }

    /// Silence tolerated before a peer is declared dead (`limit × duration`).
    pub fn silence_window(&self) -> Duration {
        self.epoch_duration * self.epoch_limit
    }
}

/// Map a 0–6 verbosity level onto a `log` filter.
pub fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.epoch_limit, 5);
        assert_eq!(cfg.epoch_duration, Duration::from_millis(2000));
        assert_eq!(cfg.loss, LossConfig::none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn silence_window_is_limit_times_duration() {
        assert_eq!(
            Config::new(5, 100).silence_window(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn rejects_zero_limit_and_duration() {
        assert!(matches!(
            Config::new(0, 100).validate(),
            Err(LspError::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::new(5, 0).validate(),
            Err(LspError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_drop_percent() {
        let cfg = Config::new(5, 100).with_loss(LossConfig::new(0, 101));
        assert!(matches!(cfg.validate(), Err(LspError::InvalidConfig(_))));
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_filter(0), LevelFilter::Off);
        assert_eq!(level_filter(3), LevelFilter::Info);
        assert_eq!(level_filter(6), LevelFilter::Trace);
        assert_eq!(level_filter(42), LevelFilter::Trace);
    }
}
