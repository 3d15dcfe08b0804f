//! Process-wide logger setup.

use env_logger::{Builder, Env};
use std::io::Write;

/// Install the `env_logger` backend. `RUST_LOG` wins over `default_filter`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_filter: &str) {
    let env = Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_filter);
    let _ = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .try_init();
}
