use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat, LoggingConfig};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Level and format after applying the CLI override to `[logging]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(
        logging: Option<&LoggingConfig>,
        cli_level_override: Option<&str>,
    ) -> anyhow::Result<Self> {
        let configured = logging.and_then(|logging| logging.level.as_deref());
        let level = match cli_level_override.or(configured) {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LOG_LEVEL,
        };
        Ok(Self {
            level,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

/// Installs the global subscriber. Logs go to stderr; stdout is reserved
/// for command output.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config.logging.as_ref(), cli_level_override)?;
    tracing::subscriber::set_global_default(subscriber(settings, std::io::stderr))
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn subscriber<W>(settings: LogSettings, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(writer);
    match settings.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    }
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim().to_ascii_lowercase().parse().map_err(|_| {
        anyhow!("invalid log level `{raw}`; expected one of trace, debug, info, warn, error, off")
    })
}
