//! System resource sampling and growth gating.
//!
//! The probe reads memory and CPU fractions from the OS; the governor
//! turns samples into constrained flags with resume hysteresis and
//! answers the one question the pool asks on each tick: may it add a
//! worker right now.

use sysinfo::System;

/// Growth gate on instantaneous CPU, distinct from the stop/resume
/// constrained-flag thresholds
const GROWTH_CPU_GATE: f64 = 0.55;
/// Predicted memory at current+2 workers must stay under this
const GROWTH_HEADROOM: f64 = 0.70;
/// Consecutive below-resume samples needed to clear a constrained flag
const RESUME_SAMPLES: u32 = 2;
/// Assumed per-worker memory fraction before any real measurement
const DEFAULT_WORKER_FRACTION: f64 = 0.015;

/// One reading of system pressure, as fractions of capacity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub memory_fraction: f64,
    pub cpu_fraction: f64,
}

/// Source of resource samples. Swappable so tests can script pressure.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Option<ResourceSample>;
    fn total_memory_bytes(&self) -> u64;
}

/// sysinfo-backed probe with a load-average fallback when the CPU
/// refresh yields nothing useful.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // First refresh so total_memory is available immediately
        system.refresh_memory();
        SystemProbe { system }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        let memory_fraction = self.system.used_memory() as f64 / total as f64;

        let cpu_percent = self.system.global_cpu_usage() as f64;
        let cpu_fraction = if cpu_percent.is_finite() && cpu_percent > 0.0 {
            (cpu_percent / 100.0).min(1.0)
        } else {
            // Fallback: load average scaled by core count
            let cores = num_cores().max(1) as f64;
            (System::load_average().one / cores).clamp(0.0, 1.0)
        };

        Some(ResourceSample {
            memory_fraction: memory_fraction.clamp(0.0, 1.0),
            cpu_fraction,
        })
    }

    fn total_memory_bytes(&self) -> u64 {
        self.system.total_memory()
    }
}

/// Logical core count, never zero.
pub fn num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Stop/resume hysteresis state over resource samples.
pub struct ResourceGovernor {
    memory_stop: f64,
    memory_resume: f64,
    cpu_stop: f64,
    cpu_resume: f64,
    memory_constrained: bool,
    cpu_constrained: bool,
    mem_resume_streak: u32,
    cpu_resume_streak: u32,
    last_sample: Option<ResourceSample>,
    /// Mean per-worker memory fraction for growth prediction
    worker_fraction: f64,
}

impl ResourceGovernor {
    pub fn new(memory_stop: f64, memory_resume: f64, cpu_stop: f64, cpu_resume: f64) -> Self {
        ResourceGovernor {
            memory_stop,
            memory_resume,
            cpu_stop,
            cpu_resume,
            memory_constrained: false,
            cpu_constrained: false,
            mem_resume_streak: 0,
            cpu_resume_streak: 0,
            last_sample: None,
            worker_fraction: DEFAULT_WORKER_FRACTION,
        }
    }

    /// Feed one sample; updates constrained flags.
    ///
    /// A sample above a stop threshold raises the flag immediately; the
    /// flag clears only after two consecutive samples below the resume
    /// threshold.
    pub fn observe(&mut self, sample: ResourceSample) {
        if sample.memory_fraction > self.memory_stop {
            if !self.memory_constrained {
                tracing::warn!(
                    memory = format!("{:.0}%", sample.memory_fraction * 100.0),
                    "Memory constrained, pool growth paused"
                );
            }
            self.memory_constrained = true;
            self.mem_resume_streak = 0;
        } else if self.memory_constrained {
            if sample.memory_fraction < self.memory_resume {
                self.mem_resume_streak += 1;
                if self.mem_resume_streak >= RESUME_SAMPLES {
                    self.memory_constrained = false;
                    self.mem_resume_streak = 0;
                    tracing::info!("Memory pressure cleared, growth may resume");
                }
            } else {
                self.mem_resume_streak = 0;
            }
        }

        if sample.cpu_fraction > self.cpu_stop {
            if !self.cpu_constrained {
                tracing::warn!(
                    cpu = format!("{:.0}%", sample.cpu_fraction * 100.0),
                    "CPU constrained, pool growth paused"
                );
            }
            self.cpu_constrained = true;
            self.cpu_resume_streak = 0;
        } else if self.cpu_constrained {
            if sample.cpu_fraction < self.cpu_resume {
                self.cpu_resume_streak += 1;
                if self.cpu_resume_streak >= RESUME_SAMPLES {
                    self.cpu_constrained = false;
                    self.cpu_resume_streak = 0;
                }
            } else {
                self.cpu_resume_streak = 0;
            }
        }

        self.last_sample = Some(sample);
    }

    /// Update the mean per-worker memory fraction used for prediction.
    pub fn set_worker_fraction(&mut self, fraction: f64) {
        if fraction.is_finite() && fraction > 0.0 {
            self.worker_fraction = fraction;
        }
    }

    pub fn memory_constrained(&self) -> bool {
        self.memory_constrained
    }

    pub fn cpu_constrained(&self) -> bool {
        self.cpu_constrained
    }

    pub fn last_sample(&self) -> Option<ResourceSample> {
        self.last_sample
    }

    /// Growth decision. All gates must pass:
    /// current memory under the stop line, linear predictions at +1 and
    /// +2 workers under their ceilings, instantaneous CPU under the
    /// growth gate, and neither constrained flag raised.
    pub fn can_grow(&self) -> bool {
        if self.memory_constrained || self.cpu_constrained {
            return false;
        }
        let Some(sample) = self.last_sample else {
            // No data yet: be conservative, don't grow blind
            return false;
        };
        let predicted_1 = sample.memory_fraction + self.worker_fraction;
        let predicted_2 = sample.memory_fraction + 2.0 * self.worker_fraction;

        sample.memory_fraction < self.memory_stop
            && predicted_1 < self.memory_stop
            && predicted_2 < GROWTH_HEADROOM
            && sample.cpu_fraction < GROWTH_CPU_GATE
    }
}
