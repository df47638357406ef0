//! Tracing subscriber setup from the `logging` config section.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use switchyard_core::config::LoggingConfig;

/// Build the event filter. `rust_log` (the `RUST_LOG` value) replaces the
/// configured level and filters entirely.
pub fn build_filter(
    logging: &LoggingConfig,
    verbose: bool,
    rust_log: Option<&str>,
) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::try_new(directives).context("invalid RUST_LOG");
    }

    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))?;
    for directive in &logging.filters {
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid log filter '{directive}'"))?,
        );
    }
    Ok(filter)
}

/// Install the global subscriber.
pub fn init(logging: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let defaults = LoggingConfig {
        format: "plain".into(),
        output: "stderr".into(),
        ..Default::default()
    };
    let logging = logging.unwrap_or(&defaults);
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(logging, verbose, rust_log.as_deref())?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = logging.output == "stdout";
    let result = match (logging.format.as_str(), to_stdout) {
        ("json", true) => builder
            .json()
            .flatten_event(true)
            .with_writer(std::io::stdout)
            .try_init(),
        ("json", false) => builder
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
            .try_init(),
        (_, true) => builder.with_writer(std::io::stdout).try_init(),
        (_, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!(e))
}
