use std::{env, thread, time::Duration};

/// Field prefix used when a channel does not configure one
pub const DEFAULT_FIELD: &str = "value";

/// Get the monitor wait window, either from environment or default 0.2 s
pub fn get_default_monitor_wait() -> Duration {
    let default = Duration::from_secs_f32(0.2);
    env::var("PVBRIDGE_MONITOR_WAIT")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .and_then(|s| Duration::try_from_secs_f32(s.max(0.001)).ok())
        .unwrap_or(default)
}

/// Get the sleep between put completion checks, either from environment or default 0.1 s
pub fn get_default_put_poll_interval() -> Duration {
    let default = Duration::from_secs_f32(0.1);
    env::var("PVBRIDGE_PUT_POLL_INTERVAL")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .and_then(|s| Duration::try_from_secs_f32(s.max(0.001)).ok())
        .unwrap_or(default)
}

pub fn get_default_put_poll_iterations() -> u32 {
    10
}

/// Stack size for worker threads, when not configured
pub fn get_default_stack_size() -> usize {
    4 * 2 * 1024 * 1024
}

/// How long to wait for workers to notice a stop request before giving up
pub fn get_default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Something that can block the calling thread for a while
///
/// The put protocol sleeps through one of these so that the bounded wait
/// for completion can be observed (and skipped) from tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrepresentable_environment_values_use_defaults() {
        // Both values overflow a Duration; anything reading them falls back to the default
        unsafe {
            env::set_var("PVBRIDGE_MONITOR_WAIT", "inf");
            env::set_var("PVBRIDGE_PUT_POLL_INTERVAL", "1e39");
        }
        assert_eq!(get_default_monitor_wait(), Duration::from_secs_f32(0.2));
        assert_eq!(get_default_put_poll_interval(), Duration::from_secs_f32(0.1));
    }
}
