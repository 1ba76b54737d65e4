//! Structured logging surface for the crate. Components receive an optional
//! parent logger and fall back to a discarding root, so library users who do
//! not care about logs pay nothing.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

/// Derives a component logger from an optional parent.
pub fn component<'a, L: Into<Option<&'a Logger>>>(log: L, name: &'static str) -> Logger {
    match log.into() {
        Some(log) => log.new(o!("component" => name)),
        None => Logger::root(Discard, o!()),
    }
}

/// Builds a terminal logger writing to stderr at the given level
/// (`"trace"`, `"debug"`, `"info"`, `"warning"`, `"error"`).
pub fn init(level: &str) -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Logger config must parse");

    config.build_logger().expect("Logger must build")
}
