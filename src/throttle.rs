use std::time::Duration;

/// Feedback loop for the remote queue poll delay.
///
/// Every rejected message pushes the delay one step up, bounded by `max`. A batch accepted in full pulls it one step
/// down, bounded by `min`.
#[derive(Debug, Clone)]
pub struct AdaptiveThrottle {
    min:   Duration,
    max:   Duration,
    step:  Duration,
    delay: Duration,
}

impl AdaptiveThrottle {
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            step,
            delay: min,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Account for the outcome of one batch and return the delay to sleep before the next poll.
    pub fn record_batch(&mut self, rejected: usize) -> Duration {
        if rejected == 0 {
            self.delay = self.delay.saturating_sub(self.step).max(self.min);
        }
        else {
            for _ in 0..rejected {
                self.delay = (self.delay + self.step).min(self.max);
            }
        }
        self.delay
    }

    /// Back off after a failed poll.
    pub fn record_failure(&mut self) -> Duration {
        self.record_batch(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn rejections_raise_delay_up_to_ceiling() {
        let mut t = AdaptiveThrottle::new(ms(100), ms(500), ms(100));
        let mut last = t.delay();
        for _ in 0..4 {
            let next = t.record_batch(1);
            assert!(next > last);
            last = next;
        }
        assert_eq!(last, ms(500));
        assert_eq!(t.record_batch(3), ms(500));
    }

    #[test]
    fn accepted_batches_lower_delay_down_to_floor() {
        let mut t = AdaptiveThrottle::new(ms(100), ms(500), ms(100));
        t.record_batch(10);
        assert_eq!(t.delay(), ms(500));
        let mut last = t.delay();
        for _ in 0..4 {
            let next = t.record_batch(0);
            assert!(next < last);
            last = next;
        }
        assert_eq!(last, ms(100));
        assert_eq!(t.record_batch(0), ms(100));
    }

    #[test]
    fn each_rejection_counts() {
        let mut t = AdaptiveThrottle::new(ms(0), ms(10_000), ms(250));
        assert_eq!(t.record_batch(3), ms(750));
    }
}
