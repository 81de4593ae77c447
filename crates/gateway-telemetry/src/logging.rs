//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber from the `observability.logging`
//! section and builds the per-provider spans the resilience manager runs
//! each protected call in.

use gateway_config::schema::{self, LogFormat};
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default level directive
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Extra filter directives appended to the level
    pub filter: Option<String>,
    /// Include source file and line
    pub include_location: bool,
    /// Emit events when provider spans open or close
    pub span_events: SpanEvents,
    /// Print timestamps (pretty and compact formats only)
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::from(&schema::LoggingConfig::default())
    }
}

impl From<&schema::LoggingConfig> for LoggingConfig {
    fn from(section: &schema::LoggingConfig) -> Self {
        Self {
            level: section.level.clone(),
            format: section.format,
            filter: section.filter.clone(),
            include_location: section.include_location,
            span_events: SpanEvents::None,
            timestamps: true,
        }
    }
}

impl LoggingConfig {
    /// Emit span lifecycle events
    #[must_use]
    pub fn with_span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    /// Append filter directives, e.g. `gateway_resilience=debug`
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Which span lifecycle events are logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanEvents {
    /// None
    #[default]
    None,
    /// On close, with busy/idle timings of the call
    Close,
    /// On creation and close
    Lifecycle,
}

impl SpanEvents {
    fn to_fmt_span(self) -> FmtSpan {
        match self {
            Self::None => FmtSpan::NONE,
            Self::Close => FmtSpan::CLOSE,
            Self::Lifecycle => FmtSpan::NEW | FmtSpan::CLOSE,
        }
    }
}

/// Install the global subscriber
///
/// # Errors
/// Returns error if the filter is invalid or a global subscriber is already set
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let spans = config.span_events.to_fmt_span();
    let location = config.include_location;

    let layer = match (config.format, config.timestamps) {
        (LogFormat::Json, _) => fmt::layer()
            .json()
            .with_span_events(spans)
            .with_file(location)
            .with_line_number(location)
            .with_current_span(true)
            .boxed(),
        (LogFormat::Pretty, true) => fmt::layer()
            .pretty()
            .with_span_events(spans)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
        (LogFormat::Pretty, false) => fmt::layer()
            .pretty()
            .without_time()
            .with_span_events(spans)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
        (LogFormat::Compact, true) => fmt::layer()
            .compact()
            .with_span_events(spans)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
        (LogFormat::Compact, false) => fmt::layer()
            .compact()
            .without_time()
            .with_span_events(spans)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match &config.filter {
        Some(directives) => EnvFilter::try_new(format!("{},{directives}", config.level))
            .map_err(|e| LoggingError::FilterParse(e.to_string())),
        // RUST_LOG wins over the configured level when set
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level))),
    }
}

/// Logging setup failure
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A global subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// The filter directives did not parse
    #[error("Failed to parse log filter: {0}")]
    FilterParse(String),
}

/// Span wrapping one protected call to a provider
#[must_use]
pub fn provider_span(provider: &str, operation: &'static str) -> Span {
    tracing::info_span!("resilience", provider = %provider, operation = operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_schema_section() {
        let section = schema::LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            filter: Some("gateway_resilience=debug".to_string()),
            include_location: true,
        };

        let config = LoggingConfig::from(&section).with_span_events(SpanEvents::Close);
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.include_location);
        assert_eq!(config.span_events, SpanEvents::Close);
        assert_eq!(config.filter.as_deref(), Some("gateway_resilience=debug"));
    }

    #[test]
    fn test_defaults_follow_schema() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.timestamps);
    }

    #[test]
    fn test_filter_directives() {
        let config = LoggingConfig::default().with_filter("gateway_resilience=trace");
        assert!(build_filter(&config).is_ok());

        let config = LoggingConfig::default().with_filter("gateway_resilience=notalevel");
        assert!(matches!(build_filter(&config), Err(LoggingError::FilterParse(_))));
    }

    #[test]
    fn test_span_events() {
        assert_eq!(SpanEvents::None.to_fmt_span(), FmtSpan::NONE);
        assert_eq!(SpanEvents::Lifecycle.to_fmt_span(), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
