use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};

use crate::event::{LoopEvent, LoopEventKind, log_event};

/// Runs loop work, containing a panic so the rest of the loop's timers still fire.
///
/// Returns `false` if `f` panicked. Never call it while holding a loop lock.
pub fn run_guarded<F: FnOnce()>(label: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            log_event(LoopEvent::new(LoopEventKind::HandlerPanicked, label).with_reason(&reason));
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
