use std::time::Duration;

use rand::Rng;

/// Exponential backoff used for PUBREL, SUBSCRIBE and UNSUBSCRIBE retries.
///
/// Each call multiplies the current value by `factor`, clamps it to
/// `max_delay`, and adds a `[0, 1)` second jitter — the same recurrence the
/// original publisher/subscriber retry logic uses.
#[derive(Debug, Clone)]
pub struct Interval {
    value: f64,
    factor: f64,
    max_delay: f64,
}

impl Interval {
    pub fn new(initial: Duration, factor: f64, max_delay: Duration) -> Self {
        Interval {
            value: initial.as_secs_f64(),
            factor,
            max_delay: max_delay.as_secs_f64(),
        }
    }

    /// Returns the next retry delay and advances internal state.
    pub fn next(&mut self) -> Duration {
        self.value *= self.factor;
        self.value = self.value.min(self.max_delay);

        let jitter: f64 = rand::thread_rng().gen_range(0.0, 1.0);

        Duration::from_secs_f64(self.value + jitter)
    }
}

/// Bandwidth-weighted backoff used for PUBLISH retries: `next = initial +
/// k*size/bandwidth`, with `k` multiplied by `factor` on every call and the
/// same `[0, 1)` jitter added.
#[derive(Debug, Clone)]
pub struct IntervalLinear {
    initial: f64,
    k: f64,
    factor: f64,
    bandwidth: f64,
}

impl IntervalLinear {
    pub fn new(initial: Duration, bandwidth: f64, factor: f64) -> Self {
        IntervalLinear {
            initial: initial.as_secs_f64(),
            k: 1.0,
            factor,
            bandwidth,
        }
    }

    /// Returns the next retry delay for a packet of `size` encoded bytes.
    pub fn next(&mut self, size: usize) -> Duration {
        let value = self.initial + (self.k * size as f64) / self.bandwidth;
        self.k *= self.factor;

        let jitter: f64 = rand::thread_rng().gen_range(0.0, 1.0);

        Duration::from_secs_f64(value + jitter)
    }
}

/// The `+ 0.25 * window_length` seconds the original adds on top of the
/// exponential [`Interval`] for SUBSCRIBE/UNSUBSCRIBE retries, to spread
/// retransmissions out as a window fills up.
pub fn window_occupancy_bonus(window_len: usize) -> Duration {
    Duration::from_secs_f64(0.25 * window_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_grows_and_clamps() {
        let mut interval = Interval::new(Duration::from_secs(4), 2.0, Duration::from_secs(20));

        let first = interval.next().as_secs_f64();
        assert!(first >= 8.0 && first < 9.0);

        let second = interval.next().as_secs_f64();
        assert!(second >= 16.0 && second < 17.0);

        // keeps doubling past max_delay, value itself clamps at 20s
        for _ in 0..10 {
            interval.next();
        }
        let clamped = interval.next().as_secs_f64();
        assert!(clamped >= 20.0 && clamped < 21.0);
    }

    #[test]
    fn interval_linear_scales_with_size_and_bandwidth() {
        let mut interval = IntervalLinear::new(Duration::from_secs(4), 10_000.0, 2.0);

        let first = interval.next(1000).as_secs_f64();
        // initial(4) + k(1)*1000/10000 = 4.1, plus jitter in [0,1)
        assert!(first >= 4.1 && first < 5.1);

        let second = interval.next(1000).as_secs_f64();
        // k has doubled to 2: 4 + 2*1000/10000 = 4.2
        assert!(second >= 4.2 && second < 5.2);
    }
}
