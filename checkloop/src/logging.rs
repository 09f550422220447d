//! Diagnostic tracing for the engine.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is separate from
//! the validation logs in `.checkloop/iterations/`, which are always written,
//! and from the JSON the CLI prints on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=checkloop=debug checkloop validate --iteration iter-... --output out.txt
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
