//! Signal bridge
//!
//! OS handlers only record the signal number; the worker loop consumes it
//! once per iteration through the `Signal` end callback.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        mod fallback;
        pub use fallback::*;
    }
}
