use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use super::error::{Result, TwitchError};

/// Run application callback code, turning a panic into `HandlerPanic`.
///
/// Callbacks never run while a lock is held, so unwinding cannot leave
/// shared state half-updated.
pub(crate) fn guarded<R>(callback: &str, f: impl FnOnce() -> R) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("{} handler panicked: {}", callback, message);
        TwitchError::HandlerPanic(format!("{} handler: {}", callback, message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_passes_through_results() {
        assert_eq!(guarded("test", || 42).unwrap(), 42);
    }

    #[test]
    fn test_guarded_catches_panics() {
        let err = guarded("notification", || -> () { panic!("boom") }).unwrap_err();
        assert!(matches!(err, TwitchError::HandlerPanic(msg) if msg.contains("boom")));

        let owned = String::from("owned boom");
        let err = guarded("revocation", move || -> () { panic!("{}", owned) }).unwrap_err();
        assert!(matches!(err, TwitchError::HandlerPanic(msg) if msg.contains("owned boom")));
    }
}
