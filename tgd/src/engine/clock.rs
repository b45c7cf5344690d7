// TGD - MONOTONIC CLOCK + RT SCHEDULING
// clock_gettime(MONOTONIC) readers and the SCHED_FIFO request used by the
// queue-stats sampler thread.

use std::io;

// ============================================================================
// MONOTONIC CLOCK
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[inline(always)]
pub fn clock_ms() -> u64 { clock_ns() / 1_000_000 }

/// Milliseconds elapsed since `since_ns`, never less than 1.
#[inline(always)]
pub fn elapsed_ms_min1(since_ns: u64, now_ns: u64) -> u64 {
    (now_ns.saturating_sub(since_ns) / 1_000_000).max(1)
}

// ============================================================================
// REAL-TIME PRIORITY
// ============================================================================

/// Move the calling thread to SCHED_FIFO at `priority`.
/// Fails without CAP_SYS_NICE; callers log and keep running at normal priority.
pub fn set_realtime_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param { sched_priority: priority };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = clock_ns();
        let b = clock_ns();
        assert!(b >= a);
    }

    #[test]
    fn elapsed_floor_is_one() {
        assert_eq!(elapsed_ms_min1(1_000, 1_500), 1);
        assert_eq!(elapsed_ms_min1(0, 20_000_000), 20);
        assert_eq!(elapsed_ms_min1(5, 1), 1);
    }
}
