//! Per-thread CPU time via `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`.
//!
//! Gated behind the `cpu-time` Cargo feature. Uses inline FFI to avoid
//! adding a `libc` dependency. On targets without a thread CPU clock the
//! probe reports unavailable and the measurement layer falls back to wall
//! time only.

#[cfg(all(feature = "cpu-time", any(target_os = "linux", target_os = "macos")))]
#[repr(C)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

#[cfg(all(feature = "cpu-time", target_os = "linux"))]
const CLOCK_THREAD_CPUTIME_ID: i32 = 3;

#[cfg(all(feature = "cpu-time", target_os = "macos"))]
const CLOCK_THREAD_CPUTIME_ID: i32 = 16;

#[cfg(all(feature = "cpu-time", any(target_os = "linux", target_os = "macos")))]
extern "C" {
    fn clock_gettime(clk_id: i32, tp: *mut Timespec) -> i32;
}

/// Read the current thread's CPU time in nanoseconds.
///
/// Measures only time the current thread spent executing on a core. Sleeps,
/// I/O waits and scheduling delays read as zero. Returns `None` when the
/// clock is not compiled in or the call fails.
#[cfg(all(
    feature = "cpu-time",
    any(target_os = "linux", target_os = "macos"),
    target_pointer_width = "64"
))]
pub(crate) fn cpu_now_ns() -> Option<u64> {
    let mut ts = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ret = unsafe { clock_gettime(CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if ret != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(not(all(
    feature = "cpu-time",
    any(target_os = "linux", target_os = "macos"),
    target_pointer_width = "64"
)))]
pub(crate) fn cpu_now_ns() -> Option<u64> {
    None
}

/// Whether the thread CPU clock answers on this platform and build.
pub(crate) fn available() -> bool {
    cpu_now_ns().is_some()
}
