//! env_logger convenience for binaries and tests. The engine itself only
//! logs through the `log` facade; backend configuration stays caller-owned.

use env_logger::Env;

/// Initializes env_logger with an `info` default filter. Repeat calls are
/// harmless, so tests can call this freely.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
}
