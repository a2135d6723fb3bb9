//! Adaptive completion-interrupt moderation.
//!
//! A smoothed receive packet rate chooses the coalescing delay between the
//! configured low and high bounds. Strongly asymmetric traffic goes straight
//! to the high bound since nobody is waiting on a prompt reply. Below
//! `moderation_rate_thresh` the low bound applies regardless of asymmetry:
//! a connection that only trickles one way is latency bound, not bandwidth
//! bound.

use std::time::Duration;

use crate::config::SdpConfig;

#[derive(Debug, Default)]
pub struct Moderator {
    avg_rate: u64,
    last_tx: u64,
    last_rx: u64,
    current: Option<(u16, u16)>,
}

impl Moderator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn avg_rate(&self) -> u64 {
        self.avg_rate
    }

    pub fn current(&self) -> Option<(u16, u16)> {
        self.current
    }

    /// Feed cumulative packet counters observed `elapsed` after the previous
    /// sample. Returns `(count, usec)` when the setting should change.
    pub fn sample(
        &mut self,
        cfg: &SdpConfig,
        tx_total: u64,
        rx_total: u64,
        elapsed: Duration,
    ) -> Option<(u16, u16)> {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms == 0 {
            return None;
        }
        let tx_rate = tx_total.saturating_sub(self.last_tx) * 1000 / elapsed_ms;
        let rx_rate = rx_total.saturating_sub(self.last_rx) * 1000 / elapsed_ms;
        self.last_tx = tx_total;
        self.last_rx = rx_total;

        self.avg_rate = (self.avg_rate * 3 + rx_rate) / 4;

        let usec = target_usec(cfg, self.avg_rate, tx_rate, rx_rate);
        let setting = (
            cfg.moderation_count.min(u16::MAX as u32) as u16,
            usec.min(u16::MAX as u32) as u16,
        );
        if self.current == Some(setting) {
            return None;
        }
        self.current = Some(setting);
        Some(setting)
    }
}

fn target_usec(cfg: &SdpConfig, avg_rate: u64, tx_rate: u64, rx_rate: u64) -> u32 {
    let low = cfg.moderation_usec_low.min(cfg.moderation_usec_high);
    let high = cfg.moderation_usec_low.max(cfg.moderation_usec_high);
    if avg_rate <= cfg.moderation_rate_thresh {
        return low;
    }
    if tx_rate.saturating_mul(2) > rx_rate.saturating_mul(3)
        || rx_rate.saturating_mul(2) > tx_rate.saturating_mul(3)
    {
        return high;
    }
    if avg_rate <= cfg.moderation_rate_low {
        return low;
    }
    if avg_rate >= cfg.moderation_rate_high {
        return high;
    }
    let span = cfg.moderation_rate_high.saturating_sub(cfg.moderation_rate_low).max(1);
    let pos = avg_rate - cfg.moderation_rate_low;
    low + (u64::from(high - low) * pos / span) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_idle_uses_low_bound_once() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        assert_eq!(m.sample(&cfg, 10, 10, SEC), Some((16, 0)));
        assert_eq!(m.sample(&cfg, 20, 20, SEC), None);
        assert_eq!(m.current(), Some((16, 0)));
    }

    #[test]
    fn test_asymmetric_traffic_uses_high_bound() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        assert_eq!(m.sample(&cfg, 10_000, 100_000, SEC), Some((16, 128)));
    }

    #[test]
    fn test_idle_asymmetric_traffic_stays_low() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        assert_eq!(m.sample(&cfg, 0, 50, SEC), Some((16, 0)));
        assert_eq!(m.sample(&cfg, 5_000, 50, SEC), None);
    }

    #[test]
    fn test_rate_follows_receive_side() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        m.sample(&cfg, 1_000_000, 4_000, SEC);
        assert_eq!(m.avg_rate(), 1_000);
    }

    #[test]
    fn test_inverted_bounds_do_not_underflow() {
        let cfg = SdpConfig {
            moderation_usec_low: 200,
            moderation_usec_high: 100,
            ..Default::default()
        };
        let mut m = Moderator::new();
        let mut last = None;
        for i in 1..=60u64 {
            if let Some(s) = m.sample(&cfg, i * 425_000, i * 425_000, SEC) {
                last = Some(s);
            }
        }
        let (_, usec) = last.unwrap();
        assert!((100..=200).contains(&usec), "usec {usec}");
    }

    #[test]
    fn test_balanced_rate_interpolates() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        let mut last = None;
        for i in 1..=60u64 {
            if let Some(s) = m.sample(&cfg, i * 425_000, i * 425_000, SEC) {
                last = Some(s);
            }
        }
        let (count, usec) = last.unwrap();
        assert_eq!(count, 16);
        assert!((60..=64).contains(&usec), "usec {usec}");
    }

    #[test]
    fn test_saturated_rate_uses_high_bound() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        let mut last = None;
        for i in 1..=60u64 {
            if let Some(s) = m.sample(&cfg, i * 900_000, i * 900_000, SEC) {
                last = Some(s);
            }
        }
        assert_eq!(last, Some((16, 128)));
    }

    #[test]
    fn test_zero_elapsed_is_ignored() {
        let cfg = SdpConfig::default();
        let mut m = Moderator::new();
        assert_eq!(m.sample(&cfg, 5, 5, Duration::ZERO), None);
    }
}
