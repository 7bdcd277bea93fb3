use crate::wire::MAX_PACKET_LEN;
use std::time::Duration;

/// Sliding window over the most recent round-trip observations.
const WINDOW: usize = 32;

/// Round-trip estimator feeding the BOP timeout.
///
/// Observations are the delays between writing a retransmission request and the first
///  retransmitted packet arriving for that product. The estimate starts from a configured seed
///  so that the first session iteration has a usable timeout before anything was measured.
///
/// The derived timeout is `multiplier * (mean + 2 * std_dev)`, floored by the time a
///  maximum-size packet needs to cross the configured link - a timeout below one link
///  propagation delay could never be met.
pub struct RttEstimator {
    buf: Vec<f64>,
    next: usize,
    cached_sum: f64,
    cached_square_sum: f64,

    timeout_multiplier: u32,
    link_floor: Duration,
}

impl RttEstimator {
    pub fn new(seed: Duration, timeout_multiplier: u32, link_speed_bits_per_sec: u64) -> RttEstimator {
        let initial = seed.as_secs_f64();
        let link_floor = Duration::from_secs_f64(
            (MAX_PACKET_LEN * 8) as f64 / link_speed_bits_per_sec as f64,
        );

        RttEstimator {
            buf: vec![initial],
            next: 0,
            cached_sum: initial,
            cached_square_sum: initial * initial,
            timeout_multiplier,
            link_floor,
        }
    }

    pub fn add_sample(&mut self, rtt: Duration) {
        let value = rtt.as_secs_f64();

        if self.buf.len() < WINDOW {
            self.buf.push(value);
        }
        else {
            let evicted = self.buf[self.next];
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
            self.buf[self.next] = value;
            self.next = (self.next + 1) % WINDOW;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
    }

    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.cached_sum / self.buf.len() as f64)
    }

    fn std_dev(&self) -> f64 {
        if self.buf.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let mean = self.cached_sum / self.buf.len() as f64;
        let diff_of_squares = self.cached_square_sum - mean * mean * self.buf.len() as f64;

        (diff_of_squares.max(0.0) / (self.buf.len() - 1) as f64).sqrt()
    }

    /// How long to wait for the BOP of a product whose opening was missed before giving it up.
    pub fn bop_timeout(&self) -> Duration {
        let mean = self.cached_sum / self.buf.len() as f64;
        let estimate = Duration::from_secs_f64((mean + 2.0 * self.std_dev()).max(0.0));

        (estimate * self.timeout_multiplier).max(self.link_floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RttEstimator {
        RttEstimator::new(Duration::from_millis(50), 10, 18_000_000_000_000_000)
    }

    #[test]
    fn test_seed_only() {
        let est = estimator();
        assert_eq!(est.mean(), Duration::from_millis(50));
        // no deviation yet: timeout is multiplier * seed
        assert_eq!(est.bop_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_samples_shift_the_mean() {
        let mut est = estimator();
        for _ in 0..WINDOW {
            est.add_sample(Duration::from_millis(10));
        }
        // the seed has been evicted from the window
        let mean = est.mean();
        assert!(mean > Duration::from_millis(9) && mean < Duration::from_millis(11));
        assert!(est.bop_timeout() >= Duration::from_millis(90));
    }

    #[test]
    fn test_jitter_widens_the_timeout() {
        let mut steady = estimator();
        let mut jittery = estimator();
        for i in 0..WINDOW {
            steady.add_sample(Duration::from_millis(50));
            jittery.add_sample(Duration::from_millis(if i % 2 == 0 { 10 } else { 90 }));
        }

        let diff = steady.mean().abs_diff(jittery.mean());
        assert!(diff < Duration::from_micros(1));
        assert!(jittery.bop_timeout() > steady.bop_timeout());
    }

    #[test]
    fn test_link_floor() {
        // 9600 bits per second: one full packet takes longer than a second
        let est = RttEstimator::new(Duration::from_nanos(1), 1, 9600);
        assert!(est.bop_timeout() >= Duration::from_secs(1));
    }
}
