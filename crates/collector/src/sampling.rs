use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use perfwatch_core::config::SamplingConfig;
use rand::Rng;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Collector;

/// Distance below which the adaptive rate snaps onto its goal.
const SNAP_EPSILON: f64 = 1e-4;

/// Per-trace keep/drop decision. The rate is shared with the adaptive
/// controller through an atomic; readers see the last write.
#[derive(Debug)]
pub struct Sampler {
    enabled: bool,
    rate_bits: AtomicU64,
}

impl Sampler {
    pub fn new(enabled: bool, rate: f64) -> Self {
        Self {
            enabled,
            rate_bits: AtomicU64::new(rate.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn set_rate(&self, rate: f64) {
        self.rate_bits
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_sample(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let rate = self.rate();
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        rand::thread_rng().r#gen::<f64>() < rate
    }
}

/// Monotonic counters read by the adaptive controller.
#[derive(Debug, Default)]
pub struct LoadCounters {
    offered: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    pub offered: u64,
    pub completed: u64,
    pub errors: u64,
}

impl LoadCounters {
    pub(crate) fn record_offered(&self) {
        self.offered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, errored: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            offered: self.offered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Inputs of one adaptive tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSignals {
    /// Traces requested per second, sampled or not.
    pub offered_per_sec: f64,
    pub memory_bytes: Option<u64>,
    /// Fraction of traces completed with an error since the previous tick.
    pub error_rate: f64,
}

impl LoadSignals {
    pub fn between(
        prev: LoadSnapshot,
        next: LoadSnapshot,
        elapsed: Duration,
        memory_bytes: Option<u64>,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let offered = next.offered.saturating_sub(prev.offered) as f64;
        let completed = next.completed.saturating_sub(prev.completed);
        let errors = next.errors.saturating_sub(prev.errors);

        Self {
            offered_per_sec: if secs > 0.0 { offered / secs } else { 0.0 },
            memory_bytes,
            error_rate: if completed > 0 {
                errors as f64 / completed as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    MemoryPressure,
    Throttle,
    HoldForErrors,
    Recover,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub rate: f64,
    pub reason: AdjustReason,
}

/// Feedback controller steering the sampling rate so that the recorded
/// share of the offered load stays near the target. Memory pressure always
/// wins over throughput.
#[derive(Debug, Clone)]
pub struct AdaptiveSampler {
    min_rate: f64,
    max_rate: f64,
    target_traces_per_sec: f64,
    memory_ceiling_bytes: u64,
    smoothing: f64,
    error_rate_boost_threshold: f64,
}

impl AdaptiveSampler {
    pub fn new(cfg: &SamplingConfig) -> Self {
        Self {
            min_rate: cfg.min_rate,
            max_rate: cfg.max_rate,
            target_traces_per_sec: cfg.target_traces_per_sec,
            memory_ceiling_bytes: cfg.memory_ceiling_bytes,
            smoothing: cfg.smoothing,
            error_rate_boost_threshold: cfg.error_rate_boost_threshold,
        }
    }

    pub fn next_rate(&self, current: f64, signals: &LoadSignals) -> RateDecision {
        let memory_pressure = signals
            .memory_bytes
            .is_some_and(|bytes| bytes > self.memory_ceiling_bytes);

        let (goal, reason) = if memory_pressure {
            (current * 0.5, AdjustReason::MemoryPressure)
        } else {
            let goal = if signals.offered_per_sec > 0.0 {
                self.target_traces_per_sec / signals.offered_per_sec
            } else {
                self.max_rate
            }
            .clamp(self.min_rate, self.max_rate);

            if goal < current {
                if signals.error_rate >= self.error_rate_boost_threshold {
                    (current, AdjustReason::HoldForErrors)
                } else {
                    (goal, AdjustReason::Throttle)
                }
            } else if goal > current {
                (goal, AdjustReason::Recover)
            } else {
                (current, AdjustReason::Hold)
            }
        };

        let goal = goal.clamp(self.min_rate, self.max_rate);
        let mut next = current + (goal - current) * self.smoothing;
        if (goal - next).abs() < SNAP_EPSILON {
            next = goal;
        }

        RateDecision {
            rate: next.clamp(self.min_rate, self.max_rate),
            reason,
        }
    }

    /// Runs the controller every `interval` until the task is aborted.
    pub fn spawn<P>(self, collector: Collector, mut probe: P, interval: Duration) -> JoinHandle<()>
    where
        P: MemoryProbe,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            let mut last = collector.load_snapshot();
            let mut last_at = Instant::now();
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let snapshot = collector.load_snapshot();
                let signals = LoadSignals::between(
                    last,
                    snapshot,
                    now.duration_since(last_at),
                    probe.resident_bytes(),
                );
                last = snapshot;
                last_at = now;

                let current = collector.current_sampling_rate();
                let decision = self.next_rate(current, &signals);
                if (decision.rate - current).abs() > f64::EPSILON {
                    collector.store_sampling_rate(decision.rate);
                    info!(
                        from = current,
                        to = decision.rate,
                        reason = ?decision.reason,
                        offered_per_sec = signals.offered_per_sec,
                        "adjusted sampling rate"
                    );
                } else {
                    debug!(rate = current, reason = ?decision.reason, "sampling rate unchanged");
                }
            }
        })
    }
}

pub trait MemoryProbe: Send + 'static {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Resident set size of the current process.
pub struct ProcessMemory {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|p| p.memory())
    }
}

/// Reports a constant, for hosts that meter memory themselves and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<u64>);

impl MemoryProbe for FixedMemory {
    fn resident_bytes(&mut self) -> Option<u64> {
        self.0
    }
}
