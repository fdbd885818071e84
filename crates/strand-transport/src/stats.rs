//! # Link Telemetry
//!
//! Exponentially smoothed estimators for RTT, loss, and bandwidth, plus the
//! monotonic counters surfaced alongside them. All stats are plain data and
//! serialize to JSON for export.
//!
//! Every estimator starts at zero and blends samples with
//! `new = prev·(1−α) + sample·α`; the per-stat α values come from the
//! endpoint configuration.

use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

/// Floor applied to the bandwidth window before division, so that two
/// back-to-back `update` calls cannot produce absurd rates.
pub const MIN_RATE_WINDOW: Duration = Duration::from_millis(10);

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average anchored at zero.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    /// Current smoothed value.
    value: f64,
}

impl Ewma {
    /// Create a new EWMA with the given smoothing factor.
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma { alpha, value: 0.0 }
    }

    /// Blend in a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    /// Get the current smoothed value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Reset back to zero.
    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Point-in-time view of the endpoint's network statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    /// Smoothed round-trip time in seconds.
    pub rtt: f64,
    /// Smoothed loss fraction (0.0 - 1.0).
    pub packet_loss: f64,
    /// Smoothed outbound bandwidth in bytes/sec.
    pub sent_bandwidth_bps: f64,
    /// Smoothed inbound bandwidth in bytes/sec.
    pub received_bandwidth_bps: f64,
    /// Smoothed acknowledged bandwidth in bytes/sec.
    pub acked_bandwidth_bps: f64,
    /// Payloads sent.
    pub packets_sent: u64,
    /// Payloads accepted by the local delivery callback.
    pub packets_received: u64,
    /// Sent payloads confirmed by the peer.
    pub packets_acked: u64,
    /// Datagrams discarded as undecodable.
    pub malformed_datagrams: u64,
}

// ─── Per-Tick Sample ────────────────────────────────────────────────────────

/// Raw measurements gathered by the endpoint for one `update` tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSample {
    /// Loss fraction over matured sent records.
    pub loss: f64,
    /// Bytes sent within the tick window.
    pub sent_bytes: u64,
    /// Bytes received within the tick window.
    pub received_bytes: u64,
    /// Bytes acknowledged within the RTT-shifted tick window.
    pub acked_bytes: u64,
}

// ─── Estimator ──────────────────────────────────────────────────────────────

/// Smoothed estimators plus raw counters.
pub struct StatsEstimator {
    rtt: Ewma,
    loss: Ewma,
    sent_bw: Ewma,
    received_bw: Ewma,
    acked_bw: Ewma,
    last_update: Instant,
    packets_sent: u64,
    packets_received: u64,
    packets_acked: u64,
    malformed_datagrams: u64,
}

impl StatsEstimator {
    /// Create an estimator; the first tick window starts at `now`.
    pub fn new(rtt_alpha: f64, loss_alpha: f64, bandwidth_alpha: f64, now: Instant) -> Self {
        StatsEstimator {
            rtt: Ewma::new(rtt_alpha),
            loss: Ewma::new(loss_alpha),
            sent_bw: Ewma::new(bandwidth_alpha),
            received_bw: Ewma::new(bandwidth_alpha),
            acked_bw: Ewma::new(bandwidth_alpha),
            last_update: now,
            packets_sent: 0,
            packets_received: 0,
            packets_acked: 0,
            malformed_datagrams: 0,
        }
    }

    /// Blend in one round-trip measurement.
    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt.update(sample.as_secs_f64());
    }

    /// Current smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt.value().max(0.0))
    }

    /// Width of the tick window ending at `now`, clamped to
    /// [`MIN_RATE_WINDOW`].
    pub fn elapsed_window(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
            .max(MIN_RATE_WINDOW)
    }

    /// Fold one tick's measurements into the estimators and start the next
    /// window. `dt` must be the value obtained from
    /// [`elapsed_window`](Self::elapsed_window) for the same `now`.
    pub fn apply(&mut self, now: Instant, dt: Duration, sample: TickSample) {
        let secs = dt.as_secs_f64();
        self.loss.update(sample.loss);
        self.sent_bw.update(sample.sent_bytes as f64 / secs);
        self.received_bw.update(sample.received_bytes as f64 / secs);
        self.acked_bw.update(sample.acked_bytes as f64 / secs);
        self.last_update = now;
    }

    /// Count an outbound payload.
    pub fn on_packet_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Count an accepted inbound payload.
    pub fn on_packet_received(&mut self) {
        self.packets_received += 1;
    }

    /// Count a newly acknowledged sent payload.
    pub fn on_packet_acked(&mut self) {
        self.packets_acked += 1;
    }

    /// Count an undecodable datagram.
    pub fn on_malformed(&mut self) {
        self.malformed_datagrams += 1;
    }

    /// Number of undecodable datagrams seen so far.
    pub fn malformed_datagrams(&self) -> u64 {
        self.malformed_datagrams
    }

    /// Snapshot every estimator and counter.
    pub fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            rtt: self.rtt.value(),
            packet_loss: self.loss.value(),
            sent_bandwidth_bps: self.sent_bw.value(),
            received_bandwidth_bps: self.received_bw.value(),
            acked_bandwidth_bps: self.acked_bw.value(),
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            packets_acked: self.packets_acked,
            malformed_datagrams: self.malformed_datagrams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── EWMA Tests ─────────────────────────────────────────────────────

    #[test]
    fn ewma_starts_at_zero() {
        let ewma = Ewma::new(0.1);
        assert_eq!(ewma.value(), 0.0);
    }

    #[test]
    fn ewma_first_sample_blends_from_zero() {
        let mut ewma = Ewma::new(0.1);
        let v = ewma.update(100.0);
        assert!((v - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_matches_iterated_average() {
        let samples = [12.0, 7.5, 30.0, 22.25, 18.0];
        let alpha = 0.1;

        let mut ewma = Ewma::new(alpha);
        let mut expected = 0.0;
        for &s in &samples {
            ewma.update(s);
            expected = expected * (1.0 - alpha) + s * alpha;
        }
        assert!((ewma.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn ewma_high_alpha_is_responsive() {
        let mut fast = Ewma::new(0.9);
        let mut slow = Ewma::new(0.1);
        for _ in 0..3 {
            fast.update(200.0);
            slow.update(200.0);
        }
        assert!(fast.value() > slow.value());
    }

    #[test]
    fn ewma_reset() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        ewma.reset();
        assert_eq!(ewma.value(), 0.0);
    }

    // ─── Estimator Tests ────────────────────────────────────────────────

    #[test]
    fn rtt_sample_moves_estimate_off_zero() {
        let mut stats = StatsEstimator::new(0.1, 0.1, 0.1, Instant::now());
        assert_eq!(stats.rtt(), Duration::ZERO);
        stats.record_rtt(Duration::from_millis(50));
        assert!(stats.rtt() > Duration::ZERO);
        assert!(stats.rtt() < Duration::from_millis(50));
    }

    #[test]
    fn window_is_clamped() {
        let now = Instant::now();
        let stats = StatsEstimator::new(0.1, 0.1, 0.1, now);
        assert_eq!(stats.elapsed_window(now), MIN_RATE_WINDOW);
        assert_eq!(
            stats.elapsed_window(now + Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn apply_divides_by_window() {
        let base = Instant::now();
        let mut stats = StatsEstimator::new(0.1, 0.1, 1.0, base);
        let now = base + Duration::from_secs(1);
        let dt = stats.elapsed_window(now);
        stats.apply(
            now,
            dt,
            TickSample {
                loss: 0.0,
                sent_bytes: 5000,
                received_bytes: 2500,
                acked_bytes: 1000,
            },
        );
        let snap = stats.snapshot();
        assert!((snap.sent_bandwidth_bps - 5000.0).abs() < 1e-6);
        assert!((snap.received_bandwidth_bps - 2500.0).abs() < 1e-6);
        assert!((snap.acked_bandwidth_bps - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn loss_is_smoothed() {
        let base = Instant::now();
        let mut stats = StatsEstimator::new(0.1, 0.1, 0.1, base);
        let now = base + Duration::from_millis(100);
        let dt = stats.elapsed_window(now);
        stats.apply(
            now,
            dt,
            TickSample {
                loss: 1.0,
                ..TickSample::default()
            },
        );
        let snap = stats.snapshot();
        assert!((snap.packet_loss - 0.1).abs() < 1e-9);
    }

    #[test]
    fn counters_accumulate() {
        let mut stats = StatsEstimator::new(0.1, 0.1, 0.1, Instant::now());
        stats.on_packet_sent();
        stats.on_packet_sent();
        stats.on_packet_received();
        stats.on_packet_acked();
        stats.on_malformed();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.packets_acked, 1);
        assert_eq!(snap.malformed_datagrams, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = StatsEstimator::new(0.1, 0.1, 0.1, Instant::now());
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"rtt\":0.0"));
        assert!(json.contains("\"packets_sent\":0"));
    }
}
