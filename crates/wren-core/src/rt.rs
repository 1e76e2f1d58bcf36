//! Real-time thread helpers
//!
//! The MAC's slot threads run against sample-accurate deadlines and want
//! elevated scheduling priority. Priority elevation is platform-dependent
//! and best-effort: failure to elevate is logged, never fatal.

use std::thread::JoinHandle;

/// Requested thread priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtPriority {
    Normal,
    High,
}

/// Spawn a named thread, requesting elevated priority when asked.
pub fn spawn_rt_thread<F>(name: &str, priority: RtPriority, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let name_owned = name.to_string();
    std::thread::Builder::new()
        .name(name_owned.clone())
        .spawn(move || {
            if priority == RtPriority::High {
                elevate_priority(&name_owned);
            }
            f()
        })
        .expect("failed to spawn thread")
}

#[cfg(target_os = "linux")]
fn elevate_priority(name: &str) {
    use std::mem;

    // SCHED_FIFO needs privileges; fall back silently when unavailable.
    unsafe {
        let mut param: libc::sched_param = mem::zeroed();
        param.sched_priority = 50;

        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            tracing::debug!(
                thread = name,
                err = %std::io::Error::last_os_error(),
                "could not elevate thread priority"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_priority(name: &str) {
    tracing::debug!(thread = name, "thread priority elevation unsupported");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_runs_closure() {
        let handle = spawn_rt_thread("test-thread", RtPriority::Normal, || {});
        handle.join().unwrap();
    }

    #[test]
    fn test_high_priority_never_fails() {
        // Elevation may be refused without privileges; the thread still runs.
        let handle = spawn_rt_thread("test-rt", RtPriority::High, || {});
        handle.join().unwrap();
    }
}
