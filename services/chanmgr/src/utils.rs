//! Small helpers shared across the core modules

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run application callback code, containing any panic.
///
/// Returns `false` if the callback panicked.
pub fn guard_callback<F: FnOnce()>(site: &str, callback: F) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            warn!("Listener {} panicked: {}", site, panic_message(&*payload));
            false
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[test]
    fn test_guard_callback_runs_closure() {
        let calls = AtomicUsize::new(0);
        assert!(guard_callback("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn test_guard_callback_contains_panic() {
        let ok = guard_callback("device_added", || panic!("listener bug"));
        assert!(!ok);
        assert!(logs_contain("Listener device_added panicked: listener bug"));
    }

    #[test]
    fn test_now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
