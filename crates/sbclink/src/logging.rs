//! Daemon logging.
//!
//! Two event sources share the subscriber: the daemon's own spans and the
//! messages relayed from the firmware, which the event sink emits under the
//! `firmware` target. The `--log-level` flag governs the daemon; firmware
//! messages stay visible at info and above even when the daemon itself runs
//! quieter, so turning down transfer noise never hides what the machine is
//! saying. A `RUST_LOG` environment filter overrides both.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Target used by the event sink for firmware-originated messages.
pub const FIRMWARE_TARGET: &str = "firmware";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Filter directives for the given daemon level.
fn filter_directives(level: LogLevel) -> String {
    format!("{},{FIRMWARE_TARGET}=info", level.as_directive())
}

fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level)))
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        // Targets stay on so firmware-relayed lines are attributable.
        .with_target(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_messages_survive_a_quiet_daemon() {
        let directives = filter_directives(LogLevel::Error);
        assert_eq!(directives, "error,firmware=info");
    }

    #[test]
    fn directives_parse_as_env_filters() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            let directives = filter_directives(level);
            assert!(
                EnvFilter::builder().parse(&directives).is_ok(),
                "directives {directives:?} must parse"
            );
        }
    }

    #[test]
    fn levels_parse_from_cli_names() {
        assert_eq!(
            LogLevel::from_str("debug", true).unwrap(),
            LogLevel::Debug
        );
        assert!(LogLevel::from_str("verbose", true).is_err());
    }
}
