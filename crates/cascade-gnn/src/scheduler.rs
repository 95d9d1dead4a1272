//! Reduce-on-plateau learning-rate control for pretraining.
//!
//! The adaptation stages keep a fixed step size and do not use this.

/// Lowers the step size by `factor` once the monitored loss has not improved
/// for `patience` consecutive epochs. The rate never drops below `min_lr`.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f32,
    patience: usize,
    min_lr: f32,
    current_lr: f32,
    best_loss: f32,
    stale_epochs: usize,
    reductions: usize,
}

impl PlateauScheduler {
    /// # Example
    /// ```
    /// use cascade_gnn::scheduler::PlateauScheduler;
    ///
    /// let mut scheduler = PlateauScheduler::new(1e-3, 0.5, 5, 1e-6);
    /// assert_eq!(scheduler.observe(0.7), 1e-3);
    /// ```
    pub fn new(initial_lr: f32, factor: f32, patience: usize, min_lr: f32) -> Self {
        Self {
            factor,
            patience: patience.max(1),
            min_lr,
            current_lr: initial_lr,
            best_loss: f32::INFINITY,
            stale_epochs: 0,
            reductions: 0,
        }
    }

    /// Feed one epoch's monitored loss and get the rate for the next epoch.
    pub fn observe(&mut self, loss: f32) -> f32 {
        if loss < self.best_loss - 1e-8 {
            self.best_loss = loss;
            self.stale_epochs = 0;
            return self.current_lr;
        }

        self.stale_epochs += 1;
        if self.stale_epochs >= self.patience {
            let lowered = (self.current_lr * self.factor).max(self.min_lr);
            if lowered < self.current_lr {
                self.reductions += 1;
            }
            self.current_lr = lowered;
            self.stale_epochs = 0;
        }
        self.current_lr
    }

    /// How many times the rate actually went down.
    pub fn reductions(&self) -> usize {
        self.reductions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves_after_patience_runs_out() {
        let mut scheduler = PlateauScheduler::new(1e-3, 0.5, 5, 1e-6);
        assert_eq!(scheduler.observe(1.0), 1e-3);
        assert_eq!(scheduler.observe(0.9), 1e-3);

        for _ in 0..4 {
            assert_eq!(scheduler.observe(0.95), 1e-3);
        }
        assert_eq!(scheduler.observe(0.95), 5e-4);
        assert_eq!(scheduler.reductions(), 1);

        // an improvement resets the stale count but keeps the lowered rate
        assert_eq!(scheduler.observe(0.5), 5e-4);
    }

    #[test]
    fn test_rate_stops_at_floor() {
        let mut scheduler = PlateauScheduler::new(1e-3, 0.5, 1, 1e-6);
        scheduler.observe(0.5);
        let mut lr = 0.0;
        for _ in 0..100 {
            lr = scheduler.observe(1.0);
        }
        assert_eq!(lr, 1e-6);
        assert_eq!(scheduler.reductions(), 10);
    }
}
