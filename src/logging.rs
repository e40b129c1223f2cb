//! `env_logger` setup. The tracker itself only goes through the `log` macros.
//!
//! Log records are formatted on the allocating thread, so while the tracker
//! is the global allocator every allocation the logger makes for one of the
//! tracker's own lines is served untracked.

use env_logger::{Builder, Env};

/// Honour `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init();
}

/// Everything at `debug` and up, captured by the test harness
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
