use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbosity`. Calling
/// this more than once is harmless.
pub fn init(verbosity: u8, colorized: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(colorized)
                .with_thread_names(true),
        )
        .try_init();
}
