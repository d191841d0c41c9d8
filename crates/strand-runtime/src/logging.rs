//! Logging initialization

use flexi_logger::Logger;
use std::sync::Once;

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Initializes logging features.
///
/// Log levels come from the environment (`RUST_LOG`); repeated calls are
/// no-ops.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        Logger::try_with_env_or_str("info").unwrap().start().unwrap();
    });
}
