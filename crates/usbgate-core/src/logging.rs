//! Logger bootstrap shared by the daemon and the CLI.

use env_logger::{Builder, Env};

/// Install the process-wide logger.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Calling this
/// more than once is harmless.
pub fn init(default_filter: &str) {
    let _ = Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .try_init();
}
