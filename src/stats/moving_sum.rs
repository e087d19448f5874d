//! Fixed-window sum over the last `window` samples, backed by a ring buffer.

use super::sum::Sumer;

#[derive(Debug, Clone)]
pub struct MovingSum {
    window: usize,
    n: i64,
    values: Vec<f64>,
    last: usize,
    sum: f64,
}

impl MovingSum {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "window must be positive");
        MovingSum {
            window,
            n: 0,
            values: vec![0.0; window],
            last: 0,
            sum: 0.0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn last(&self) -> f64 {
        self.values[self.last]
    }

    /// Value added `n` additions ago (clamped to how many are actually held).
    pub fn last_n(&self, n: usize) -> f64 {
        let held = self.n.min(self.window as i64) as usize;
        let n = n.min(held.saturating_sub(1));
        let idx = (self.last + self.window - n) % self.window;
        self.values[idx]
    }
}

impl Sumer for MovingSum {
    fn add(&mut self, val: f64) {
        self.last = (self.last + 1) % self.window;
        self.sum -= self.values[self.last];
        self.values[self.last] = val;
        self.sum += val;
        if self.n < self.window as i64 {
            self.n += 1;
        }
    }

    fn sum(&self) -> f64 {
        self.sum
    }

    fn n(&self) -> i64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_law_keeps_only_last_w_samples() {
        let mut ms = MovingSum::new(5);
        for v in 1..=6 {
            ms.add(v as f64);
        }
        // window holds [2,3,4,5,6]
        assert_eq!(ms.sum(), 20.0);
        assert_eq!(ms.n(), 5);
    }

    #[test]
    fn n_saturates_at_window_before_filling() {
        let mut ms = MovingSum::new(5);
        ms.add(1.0);
        ms.add(2.0);
        assert_eq!(ms.n(), 2);
        assert_eq!(ms.sum(), 3.0);
    }

    #[test]
    fn last_and_last_n() {
        let mut ms = MovingSum::new(3);
        ms.add(10.0);
        ms.add(20.0);
        ms.add(30.0);
        assert_eq!(ms.last(), 30.0);
        assert_eq!(ms.last_n(0), 30.0);
        assert_eq!(ms.last_n(1), 20.0);
        assert_eq!(ms.last_n(2), 10.0);
    }
}
