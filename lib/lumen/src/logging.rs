use sloggers::{Config, LoggerConfig};

/// Errors building a logger from configuration.
pub type BuildError = Box<dyn std::error::Error + Send + Sync>;

/// Builds the default terminal logger used by the runtime. Components accept
/// an `Option<&Logger>` and fall back to `slog::Discard` when none is given,
/// so passing this logger in is always optional.
pub fn terminal_logger() -> slog::Logger {
    from_toml_config(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("default logger config must build")
}

/// Builds a logger from a sloggers TOML configuration string.
pub fn from_toml_config(config: &str) -> Result<slog::Logger, BuildError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    Ok(config.build_logger()?)
}
