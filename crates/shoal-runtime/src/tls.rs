//! Thread-local worker identity
//!
//! Only the worker id lives here. Everything else a worker needs is carried
//! by its `WorkerContext`. The id is what `kill_worker(None)` and signal
//! handling use to find "the current worker".

use shoal_core::constants::WORKER_NONE;
use shoal_core::error::clear_last_error;
use std::cell::Cell;

thread_local! {
    /// Worker bound to this OS thread
    static WORKER_ID: Cell<usize> = const { Cell::new(WORKER_NONE) };
}

/// Bind the current thread to `id`
#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

/// Current worker id, `WORKER_NONE` outside a worker
#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|cell| cell.get())
}

#[inline]
pub fn try_current_worker_id() -> Option<usize> {
    match worker_id() {
        WORKER_NONE => None,
        id => Some(id),
    }
}

/// Unbind the worker and reset per-thread error state
pub fn clear() {
    WORKER_ID.with(|cell| cell.set(WORKER_NONE));
    clear_last_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::error::{last_error, set_last_error, Code, ERR_PROTOCOL};

    #[test]
    fn test_bind_and_clear() {
        assert_eq!(try_current_worker_id(), None);
        set_worker_id(3);
        assert_eq!(try_current_worker_id(), Some(3));
        set_last_error(ERR_PROTOCOL);
        clear();
        assert_eq!(worker_id(), WORKER_NONE);
        assert_eq!(last_error(), Code::NONE);
    }
}
