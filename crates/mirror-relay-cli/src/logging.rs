//! Subscriber setup from the `logging` config section.

use mirror_relay_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives from config; `--verbose` raises the base level to debug.
pub fn directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let base = if verbose {
        "debug".to_string()
    } else {
        config
            .and_then(|c| c.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let mut parts = vec![base];
    if let Some(config) = config {
        parts.extend(config.filters.iter().filter(|f| !f.is_empty()).cloned());
    }
    parts.join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over the config.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(config, verbose)))?;

    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}
