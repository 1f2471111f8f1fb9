use std::time::{Duration, Instant};

/// Counts events and reports their rate once per `period`.
pub struct FpsMeter {
    counter: u64,
    last_time: Instant,
    period: Duration,
}

impl FpsMeter {
    pub fn new(period: Duration) -> Self {
        Self {
            counter: 0,
            last_time: Instant::now(),
            period,
        }
    }

    pub fn increment(&mut self) {
        self.counter += 1;
    }

    /// Rate since the previous report, if a full period has passed.
    pub fn report(&mut self) -> Option<f64> {
        self.report_at(Instant::now())
    }

    fn report_at(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.last_time);
        if elapsed < self.period || elapsed.is_zero() {
            return None;
        }
        let fps = self.counter as f64 / elapsed.as_secs_f64();
        self.last_time = now;
        self.counter = 0;
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_once_per_period() {
        let mut meter = FpsMeter::new(Duration::from_secs(2));
        let start = meter.last_time;
        for _ in 0..60 {
            meter.increment();
        }
        assert!(meter.report_at(start + Duration::from_secs(1)).is_none());
        let fps = meter.report_at(start + Duration::from_secs(2)).unwrap();
        assert!((fps - 30.0).abs() < 1e-9);
        assert_eq!(meter.report_at(start + Duration::from_secs(5)), Some(0.0));
    }
}
