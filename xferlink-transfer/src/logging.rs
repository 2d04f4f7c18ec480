use std::sync::Once;

use log::LevelFilter;
use logforth::diagnostic::ThreadLocalDiagnostic;

const DEFAULT_FILTER: &str = "info,xferlink_transfer=debug";

static INIT: Once = Once::new();

/// Installs the stderr logger unless the host process already set one up.
pub fn ensure_initialized() {
    if log::max_level() != LevelFilter::Off {
        return;
    }

    INIT.call_once(|| {
        let filter_str =
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        let filter: logforth::filter::EnvFilter =
            filter_str.parse().unwrap_or_else(|_| "info".into());

        let mut builder = logforth::starter_log::builder();
        builder = builder.dispatch(|d| {
            d.filter(filter)
                .diagnostic(ThreadLocalDiagnostic::default())
                .append(logforth::append::Stderr::default())
        });
        builder.apply();
    });
}
