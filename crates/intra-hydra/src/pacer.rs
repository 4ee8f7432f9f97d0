//! Rate-aware submission pacing
//!
//! `requests_per_second` is the aggregate target across the whole fleet;
//! dividing by the fleet size spreads submissions evenly over the
//! credentials. The `min_request_delay` floor prevents pathologically tight
//! submit loops when the fleet is large.

use std::time::Duration;

/// Computes the delay the submit path sleeps after enqueuing a worker.
#[derive(Debug, Clone)]
pub struct Pacer {
    requests_per_second: f64,
    min_request_delay: Duration,
}

impl Pacer {
    pub fn new(requests_per_second: f64, min_request_delay: Duration) -> Self {
        Self {
            requests_per_second,
            min_request_delay,
        }
    }

    /// `max(min_request_delay, 1 / (requests_per_second * fleet_size))`.
    pub fn submit_delay(&self, fleet_size: usize) -> Duration {
        if fleet_size == 0 || self.requests_per_second <= 0.0 {
            return self.min_request_delay;
        }
        let spread = 1.0 / (self.requests_per_second * fleet_size as f64);
        self.min_request_delay.max(Duration::from_secs_f64(spread))
    }

    /// Sleep out the submission delay for the current fleet size.
    pub async fn pace(&self, fleet_size: usize) {
        tokio::time::sleep(self.submit_delay(fleet_size)).await;
    }
}
