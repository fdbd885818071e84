//! Impairment parameters applied to every outbound datagram.

use std::time::Duration;

/// Simulated link conditions.
///
/// `loss_rate` is the probability an outbound datagram is silently dropped.
/// Surviving datagrams are delayed by `base_latency` plus a uniform draw
/// from `[0, jitter)`.
#[derive(Debug, Clone, Default)]
pub struct Impairment {
    /// Drop probability, within `[0, 1]`.
    pub loss_rate: f64,
    /// Fixed one-way delay added to every datagram.
    pub base_latency: Duration,
    /// Upper bound of the uniform random delay added on top.
    pub jitter: Duration,
}

impl Impairment {
    /// A fully transparent link: no loss, no delay.
    pub fn pristine() -> Self {
        Impairment::default()
    }

    /// Validate the parameter ranges. Panics on an impossible loss rate.
    pub(crate) fn validate(&self) {
        assert!(
            (0.0..=1.0).contains(&self.loss_rate),
            "loss rate must be within [0, 1]"
        );
    }
}
