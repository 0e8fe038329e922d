//! Logging bootstrap shared by the binaries.

use log::LevelFilter;
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global logger at `level` (`error`, `warn`, `info`, `debug`, `trace`).
///
/// Unknown levels fall back to `info`. The filter comes from the caller only and
/// `RUST_LOG` is not consulted. Repeated calls are ignored.
pub fn init(level: &str) {
    let filter = LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info);
    INIT.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(filter)
            .format_timestamp(None)
            .format_target(false)
            .try_init();
    });
}
