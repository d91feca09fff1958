//! Adaptive batch sizing with hysteresis.
//!
//! The controller hunts for the throughput-optimal batch size inside
//! configured bounds, then pins it. Shrinks need confirmation, growth
//! against the last direction needs a wider margin, and an oscillation
//! guard stops limit cycles. Failures drop into a separate recovery
//! regime below the normal bounds.

use std::collections::VecDeque;

use crate::config::PoolSettings;

/// Sliding window length for throughput statistics
const WINDOW_LEN: usize = 20;
/// Sizes inspected by the oscillation guard
const OSCILLATION_SPAN: usize = 6;
/// Local extrema within the span that trigger the guard
const OSCILLATION_EXTREMA: usize = 3;
/// Hysteresis when continuing in the same direction
const HYSTERESIS_SAME: f64 = 0.05;
/// Hysteresis when reversing direction
const HYSTERESIS_REVERSE: f64 = 0.10;
/// Stable measurements that end optimization
const STABLE_TO_CONVERGE: u32 = 5;
/// Shrink confirmations that end optimization
const SHRINKS_TO_CONVERGE: u32 = 2;
/// First recovery batch size
const RECOVERY_START: usize = 50;
/// Recovery size floor
const RECOVERY_FLOOR: usize = 10;

/// One completed batch measurement
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub size: usize,
    pub duration_ms: u64,
    pub memory_delta_bytes: i64,
    pub throughput: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Grow,
    Shrink,
}

/// Batch size controller. Not thread-safe by itself; the pool owns one
/// behind its own lock.
pub struct BatchController {
    min: usize,
    max: usize,
    step: usize,
    current: usize,
    optimizing: bool,
    optimal: Option<usize>,
    window: VecDeque<BatchRecord>,
    last_direction: Option<Direction>,
    shrink_confirmations: u32,
    stable_streak: u32,
    consecutive_failures: u32,
    recovery_size: usize,
    size_before_recovery: usize,
}

impl BatchController {
    pub fn new(settings: &PoolSettings) -> Self {
        BatchController {
            min: settings.batch_min,
            max: settings.batch_max,
            step: settings.batch_step,
            current: settings.batch_start.clamp(settings.batch_min, settings.batch_max),
            optimizing: true,
            optimal: None,
            window: VecDeque::with_capacity(WINDOW_LEN),
            last_direction: None,
            shrink_confirmations: 0,
            stable_streak: 0,
            consecutive_failures: 0,
            recovery_size: RECOVERY_START,
            size_before_recovery: settings.batch_start,
        }
    }

    pub fn current_size(&self) -> usize {
        if self.in_recovery() {
            self.recovery_size
        } else {
            self.current
        }
    }

    pub fn optimal_size(&self) -> Option<usize> {
        self.optimal
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimizing
    }

    pub fn in_recovery(&self) -> bool {
        self.consecutive_failures > 0
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Batch size for retry sub-batches while in recovery
    pub fn recovery_size(&self) -> usize {
        self.recovery_size
    }

    /// Record a successful batch and adjust the size.
    pub fn record_success(&mut self, size: usize, duration_ms: u64, memory_delta_bytes: i64) {
        if self.in_recovery() {
            // Success ends recovery: restore a conservative size
            self.current = self
                .size_before_recovery
                .min(2 * self.recovery_size)
                .clamp(self.min, self.max);
            self.consecutive_failures = 0;
            self.recovery_size = RECOVERY_START;
            tracing::info!(size = self.current, "Batch recovery complete");
            return;
        }

        let throughput = if duration_ms == 0 {
            size as f64 * 1000.0
        } else {
            size as f64 * 1000.0 / duration_ms as f64
        };
        self.push_record(BatchRecord {
            size,
            duration_ms,
            memory_delta_bytes,
            throughput,
            success: true,
        });

        if !self.optimizing {
            return;
        }
        if self.oscillating() {
            self.pin_optimal("oscillation guard");
            return;
        }
        if self.window.len() < 2 {
            return;
        }

        let avg = self.weighted_average_throughput();
        let last = throughput;

        let grow_h = self.hysteresis_for(Direction::Grow);
        let shrink_h = self.hysteresis_for(Direction::Shrink);

        if last > avg * (1.0 + grow_h) {
            self.current = (self.current + self.step).min(self.max);
            self.last_direction = Some(Direction::Grow);
            self.shrink_confirmations = 0;
            self.stable_streak = 0;
            tracing::debug!(size = self.current, throughput = last, "Batch size grew");
        } else if last < avg * (1.0 - shrink_h) {
            self.current = self.current.saturating_sub(self.step).max(self.min);
            self.last_direction = Some(Direction::Shrink);
            self.stable_streak = 0;
            self.shrink_confirmations += 1;
            tracing::debug!(size = self.current, throughput = last, "Batch size shrank");
            if self.shrink_confirmations >= SHRINKS_TO_CONVERGE {
                self.pin_optimal("confirmed shrink");
            }
        } else {
            self.stable_streak += 1;
            self.shrink_confirmations = 0;
            if self.stable_streak >= STABLE_TO_CONVERGE {
                self.pin_optimal("stable throughput");
            }
        }
    }

    /// Record a batch failure: enter or deepen recovery mode.
    pub fn record_failure(&mut self) {
        if self.consecutive_failures == 0 {
            self.size_before_recovery = self.current;
            self.recovery_size = RECOVERY_START;
        } else {
            self.recovery_size = (self.recovery_size / 2).max(RECOVERY_FLOOR);
        }
        self.consecutive_failures += 1;
        tracing::warn!(
            consecutive_failures = self.consecutive_failures,
            recovery_size = self.recovery_size,
            "Batch failure, recovery size engaged"
        );
    }

    /// Memory pressure: cut the working size immediately.
    pub fn on_memory_constrained(&mut self) {
        let cut = self.step.max((self.current as f64 * 0.2) as usize);
        let reduced = self.current.saturating_sub(cut).max(self.min);
        if reduced != self.current {
            tracing::info!(from = self.current, to = reduced, "Batch size cut under memory pressure");
            self.current = reduced;
        }
    }

    fn pin_optimal(&mut self, reason: &str) {
        self.optimal = Some(self.current);
        self.optimizing = false;
        tracing::info!(size = self.current, reason, "Batch size converged");
    }

    fn push_record(&mut self, record: BatchRecord) {
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(record);
    }

    /// Linearly recency-weighted mean throughput over the window.
    fn weighted_average_throughput(&self) -> f64 {
        let n = self.window.len();
        if n == 0 {
            return 0.0;
        }
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (i, record) in self.window.iter().enumerate() {
            let weight = (i + 1) as f64;
            weighted += record.throughput * weight;
            total_weight += weight;
        }
        weighted / total_weight
    }

    fn hysteresis_for(&self, proposed: Direction) -> f64 {
        match self.last_direction {
            Some(last) if last != proposed => HYSTERESIS_REVERSE,
            _ => HYSTERESIS_SAME,
        }
    }

    /// ≥3 strict local extrema among the last 6 recorded sizes.
    fn oscillating(&self) -> bool {
        let n = self.window.len();
        if n < OSCILLATION_SPAN {
            return false;
        }
        let sizes: Vec<usize> = self
            .window
            .iter()
            .skip(n - OSCILLATION_SPAN)
            .map(|r| r.size)
            .collect();
        let extrema = sizes
            .windows(3)
            .filter(|w| (w[1] > w[0] && w[1] > w[2]) || (w[1] < w[0] && w[1] < w[2]))
            .count();
        extrema >= OSCILLATION_EXTREMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BatchController {
        BatchController::new(&PoolSettings::default())
    }

    #[test]
    fn test_starts_at_configured_size() {
        let c = controller();
        assert_eq!(c.current_size(), 400);
        assert!(c.is_optimizing());
        assert!(c.optimal_size().is_none());
    }

    #[test]
    fn test_grows_on_throughput_jump() {
        let mut c = controller();
        // Establish a baseline, then a clear jump
        c.record_success(400, 1000, 0); // 400 c/s
        c.record_success(400, 1000, 0);
        c.record_success(400, 500, 0); // 800 c/s — way past +5%
        assert_eq!(c.current_size(), 500);
    }

    #[test]
    fn test_shrinks_twice_then_converges() {
        let mut c = controller();
        c.record_success(400, 1000, 0);
        c.record_success(400, 1000, 0);
        c.record_success(400, 2500, 0); // 160 c/s — deep drop, shrink #1
        assert_eq!(c.current_size(), 300);
        assert!(c.is_optimizing());
        c.record_success(300, 4000, 0); // 75 c/s — shrink #2, converge
        assert!(!c.is_optimizing());
        assert_eq!(c.optimal_size(), Some(200));
    }

    #[test]
    fn test_five_stable_measurements_converge() {
        let mut c = controller();
        for _ in 0..7 {
            c.record_success(400, 1000, 0); // constant throughput
        }
        assert!(!c.is_optimizing());
        assert_eq!(c.optimal_size(), Some(400));
    }

    #[test]
    fn test_bounds_respected() {
        let mut c = controller();
        // Alternate extreme jumps upward; size must never pass max
        for i in 0..10 {
            c.record_success(c.current_size(), 1000 / (i + 2), 0);
            assert!(c.current_size() <= 800);
            if !c.is_optimizing() {
                break;
            }
        }
    }

    #[test]
    fn test_oscillation_guard_pins() {
        let mut c = controller();
        // Hand-feed an oscillating size history; throughputs chosen to
        // keep flipping direction
        let sizes = [400, 500, 400, 500, 400, 500];
        let durations = [1000, 2000, 700, 2600, 600, 2900];
        for (size, duration) in sizes.iter().zip(durations.iter()) {
            c.record_success(*size, *duration, 0);
            if !c.is_optimizing() {
                break;
            }
        }
        assert!(!c.is_optimizing(), "guard or convergence stopped the hunt");
        assert!(c.optimal_size().is_some());
    }

    #[test]
    fn test_failure_recovery_ladder() {
        let mut c = controller();
        assert!(!c.in_recovery());

        c.record_failure();
        assert!(c.in_recovery());
        assert_eq!(c.recovery_size(), 50);
        assert_eq!(c.current_size(), 50);

        c.record_failure();
        assert_eq!(c.recovery_size(), 25);
        c.record_failure();
        assert_eq!(c.recovery_size(), 12);
        c.record_failure();
        assert_eq!(c.recovery_size(), 10, "floor at 10");
        c.record_failure();
        assert_eq!(c.recovery_size(), 10);
        assert_eq!(c.consecutive_failures(), 5);
    }

    #[test]
    fn test_recovery_success_restores_capped_size() {
        let mut c = controller();
        c.record_failure();
        c.record_failure(); // recovery 25
        c.record_success(25, 100, 0);
        assert!(!c.in_recovery());
        assert_eq!(c.consecutive_failures(), 0);
        // min(previous=400, 2*25=50) clamped to batch_min=200
        assert_eq!(c.current_size(), 200);
    }

    #[test]
    fn test_memory_constrained_cut() {
        let mut c = controller();
        c.on_memory_constrained();
        // max(step=100, 0.2*400=80) = 100 → 300
        assert_eq!(c.current_size(), 300);
        c.on_memory_constrained();
        assert_eq!(c.current_size(), 200);
        c.on_memory_constrained();
        assert_eq!(c.current_size(), 200, "never below min");
    }

    #[test]
    fn test_window_is_bounded() {
        let mut c = controller();
        for _ in 0..40 {
            c.record_success(400, 1000, 0);
        }
        assert!(c.window.len() <= WINDOW_LEN);
    }
}
