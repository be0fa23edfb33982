//! Tracing setup for binaries embedding the engine

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,sqlflow=debug";
const LOG_FORMAT_VAR: &str = "SQLFLOW_LOG_FORMAT";

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

/// Initialize tracing with structured logging.
///
/// `RUST_LOG` overrides the default filter; `SQLFLOW_LOG_FORMAT=json`
/// switches to one JSON object per event.
pub fn init_tracing() -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (compact, json) = if wants_json(std::env::var(LOG_FORMAT_VAR).ok().as_deref()) {
        (None, Some(fmt::layer().json().with_current_span(true).with_target(true)))
    } else {
        let compact = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .compact();
        (Some(compact), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact)
        .with(json)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_selection() {
        assert!(wants_json(Some("json")));
        assert!(wants_json(Some(" JSON ")));
        assert!(!wants_json(Some("compact")));
        assert!(!wants_json(None));
    }
}
