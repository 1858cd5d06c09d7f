//! Shared-state aliases.
//!
//! The motion worker, the scan thread and any front end share a handful of
//! structures: the position cache, the scan lifecycle state, recorded device
//! traffic in the simulator. These aliases name those shapes and keep the
//! lock implementation (`parking_lot`) in one place.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Mutex-protected value shared across threads.
pub type ThreadSafe<T> = Arc<Mutex<T>>;

/// Reader-writer protected value for state with one writer and many readers.
///
/// The position cache is written by the motion worker only and read by
/// everyone else.
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

/// A yes/no question put to the operator (e.g. "home the stage now?").
pub type ConfirmCallback = Box<dyn Fn() -> bool + Send + Sync>;

#[inline]
pub fn thread_safe<T>(value: T) -> ThreadSafe<T> {
    Arc::new(Mutex::new(value))
}

#[inline]
pub fn thread_safe_rw<T>(value: T) -> ThreadSafeRw<T> {
    Arc::new(RwLock::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_value_visible_through_clones() {
        let value: ThreadSafe<Vec<u8>> = thread_safe(Vec::new());
        let other = Arc::clone(&value);
        other.lock().push(7);
        assert_eq!(value.lock().as_slice(), &[7]);
    }

    #[test]
    fn test_rw_readers_see_writes() {
        let value = thread_safe_rw(1.5_f64);
        *value.write() = -2.0;
        assert_eq!(*value.read(), -2.0);
    }

    #[test]
    fn test_declined_confirmation() {
        let confirm: ConfirmCallback = Box::new(|| false);
        assert!(!confirm());
    }
}
