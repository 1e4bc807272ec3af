//! Panic payload formatting for isolated user code.

use std::any::Any;

/// Best-effort text of a panic payload caught by `catch_unwind`.
#[must_use]
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("non-string panic payload")
    }
}
