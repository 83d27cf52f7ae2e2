/// Fixed-length windows counted from the aggregator's start.
///
/// Window 0 holds everything before `start_time`; window `n >= 1` covers
/// `[start_time + (n-1)*interval, start_time + n*interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    start_time: i64,
    interval: i64,
}

impl Windows {
    /// `start_time` in unix seconds, `interval` in seconds (at least 1)
    pub fn new(start_time: i64, interval: i64) -> Self {
        Self {
            start_time,
            interval: interval.max(1),
        }
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn period_index(&self, t: i64) -> i64 {
        if t < self.start_time {
            return 0;
        }
        (t - self.start_time) / self.interval + 1
    }

    /// Inclusive start of window `idx`
    pub fn start_of(&self, idx: i64) -> i64 {
        self.start_time + (idx - 1) * self.interval
    }

    /// Exclusive end of window `idx`
    pub fn end_of(&self, idx: i64) -> i64 {
        self.start_time + idx * self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_start_is_window_zero() {
        let w = Windows::new(1_000, 60);
        assert_eq!(w.period_index(0), 0);
        assert_eq!(w.period_index(999), 0);
        assert_eq!(w.period_index(1_000), 1);
    }

    #[test]
    fn windows_are_half_open_and_adjacent() {
        let w = Windows::new(1_000, 60);
        for idx in 1..50 {
            assert_eq!(w.period_index(w.start_of(idx)), idx);
            assert_eq!(w.period_index(w.end_of(idx) - 1), idx);
            assert_eq!(w.period_index(w.end_of(idx)), idx + 1);
            assert_eq!(w.end_of(idx), w.start_of(idx + 1));
        }
    }

    #[test]
    fn index_never_decreases() {
        let w = Windows::new(1_700_000_000, 30);
        let mut last = 0;
        for t in (1_699_999_900..1_700_000_500).step_by(7) {
            let idx = w.period_index(t);
            assert!(idx >= last);
            last = idx;
        }
    }
}
