//! Measurement values and the clocks that produce them.
//!
//! A [`Measurement`] is a short vector of nanosecond readings. The first
//! component is always wall time from a monotonic clock and is the only one
//! used for ordering; the optional second component is thread CPU time.
//!
//! The process default source is chosen once (see [`default_source`]): thread
//! CPU + wall when the `cpu-time` feature is compiled in, enabled, and the
//! clock answers a probe, otherwise wall time alone.

use std::cmp::Ordering;
use std::ops::{Add, Sub};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::config::ProfilerConfig;
use crate::cpu_clock;

/// Largest number of components a measurement can carry.
pub const MAX_COMPONENTS: usize = 2;

/// A point-in-time reading or an elapsed span, one `u64` per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Measurement {
    values: [u64; MAX_COMPONENTS],
    len: u8,
}

impl Measurement {
    /// Wall-time-only measurement.
    pub const fn wall(wall_ns: u64) -> Self {
        Self {
            values: [wall_ns, 0],
            len: 1,
        }
    }

    /// Wall time plus thread CPU time.
    pub const fn wall_and_cpu(wall_ns: u64, cpu_ns: u64) -> Self {
        Self {
            values: [wall_ns, cpu_ns],
            len: 2,
        }
    }

    /// All-zero measurement of the given width (clamped to `1..=MAX_COMPONENTS`).
    pub fn zero(width: usize) -> Self {
        Self {
            values: [0; MAX_COMPONENTS],
            len: width.clamp(1, MAX_COMPONENTS) as u8,
        }
    }

    /// Build from raw components. `None` if the slice is empty or too long.
    pub fn from_components(components: &[u64]) -> Option<Self> {
        if components.is_empty() || components.len() > MAX_COMPONENTS {
            return None;
        }
        let mut values = [0; MAX_COMPONENTS];
        values[..components.len()].copy_from_slice(components);
        Some(Self {
            values,
            len: components.len() as u8,
        })
    }

    /// The ordering component (wall nanoseconds).
    pub fn primary(&self) -> u64 {
        self.values[0]
    }

    /// Thread CPU nanoseconds, if this measurement carries them.
    pub fn cpu(&self) -> Option<u64> {
        (self.len > 1).then(|| self.values[1])
    }

    pub fn components(&self) -> &[u64] {
        &self.values[..self.len as usize]
    }

    pub fn width(&self) -> usize {
        self.len as usize
    }

    /// Compare by the primary component only.
    pub fn cmp_primary(&self, other: &Self) -> Ordering {
        self.primary().cmp(&other.primary())
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.primary())
    }
}

impl Add for Measurement {
    type Output = Measurement;

    fn add(self, rhs: Measurement) -> Measurement {
        let mut out = self;
        for (slot, r) in out.values.iter_mut().zip(rhs.values) {
            *slot = slot.saturating_add(r);
        }
        out.len = self.len.max(rhs.len);
        out
    }
}

/// Component-wise, saturating at zero: an exit reading minus its entry
/// reading is an elapsed span, never negative.
impl Sub for Measurement {
    type Output = Measurement;

    fn sub(self, rhs: Measurement) -> Measurement {
        let mut out = self;
        for (slot, r) in out.values.iter_mut().zip(rhs.values) {
            *slot = slot.saturating_sub(r);
        }
        out
    }
}

/// Human-readable rendering: `12.345ms` or `12.345ms (cpu 3.210ms)`.
pub fn format_measurement(value: &Measurement) -> String {
    let wall_ms = value.primary() as f64 / 1_000_000.0;
    match value.cpu() {
        Some(cpu) => format!("{wall_ms:.3}ms (cpu {:.3}ms)", cpu as f64 / 1_000_000.0),
        None => format!("{wall_ms:.3}ms"),
    }
}

/// Strategy that produces measurements.
pub trait MeasurementSource: Send + Sync {
    /// Short identifier recorded in snapshots (`"wall"`, `"wall+cpu"`).
    fn name(&self) -> &'static str;

    /// Number of components every measurement from this source carries.
    fn width(&self) -> usize;

    fn measure(&self) -> Measurement;

    fn format(&self, value: &Measurement) -> String {
        format_measurement(value)
    }
}

/// Process-start epoch for wall readings.
static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic wall clock, nanoseconds since the first reading in the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl MeasurementSource for WallClock {
    fn name(&self) -> &'static str {
        "wall"
    }

    fn width(&self) -> usize {
        1
    }

    #[inline]
    fn measure(&self) -> Measurement {
        Measurement::wall(epoch().elapsed().as_nanos() as u64)
    }
}

/// Wall clock plus the calling thread's CPU clock.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCpuClock(());

impl ThreadCpuClock {
    /// `None` when the thread CPU clock is unavailable in this build or on
    /// this platform.
    pub fn new() -> Option<Self> {
        cpu_clock::available().then_some(Self(()))
    }
}

impl MeasurementSource for ThreadCpuClock {
    fn name(&self) -> &'static str {
        "wall+cpu"
    }

    fn width(&self) -> usize {
        2
    }

    #[inline]
    fn measure(&self) -> Measurement {
        let wall = epoch().elapsed().as_nanos() as u64;
        let cpu = cpu_clock::cpu_now_ns().unwrap_or(0);
        Measurement::wall_and_cpu(wall, cpu)
    }
}

/// Pick the best source for the given preference, falling back to wall time.
pub fn select_source(cpu_time: bool) -> Arc<dyn MeasurementSource> {
    if cpu_time {
        match ThreadCpuClock::new() {
            Some(clock) => {
                log::info!("measuring wall and thread CPU time");
                return Arc::new(clock);
            }
            None => log::info!("thread CPU clock unavailable, measuring wall time only"),
        }
    }
    Arc::new(WallClock)
}

static DEFAULT_SOURCE: OnceLock<Arc<dyn MeasurementSource>> = OnceLock::new();

/// The process-wide source, selected on first use from the environment
/// configuration and never swapped afterwards.
pub fn default_source() -> Arc<dyn MeasurementSource> {
    DEFAULT_SOURCE
        .get_or_init(|| select_source(ProfilerConfig::from_env().cpu_time))
        .clone()
}

/// CPU-bound workload for timing tests.
#[cfg(test)]
pub(crate) fn burn_cpu(iterations: u64) {
    let mut buf = [0x42u8; 4096];
    for i in 0..iterations {
        for b in &mut buf {
            *b = b.wrapping_add(i as u8).wrapping_mul(31);
        }
    }
    std::hint::black_box(&buf);
}

/// Deterministic source for tests: time moves only when the test advances it.
#[cfg(test)]
pub(crate) struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub(crate) fn advance(&self, ns: u64) {
        self.now
            .fetch_add(ns, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
impl MeasurementSource for ManualClock {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn width(&self) -> usize {
        1
    }

    fn measure(&self) -> Measurement {
        Measurement::wall(self.now.load(std::sync::atomic::Ordering::Relaxed))
    }
}
