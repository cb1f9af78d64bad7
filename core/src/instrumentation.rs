use opentelemetry::global::meter;
use opentelemetry::metrics::Meter;
use std::sync::{LazyLock, Once};
use tracing_subscriber::EnvFilter;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| meter("apisix-ingress-core"));

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn init_instrumentation(format: LogFormat) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true);

        // A subscriber may already be installed by an embedding process or a test harness
        let _ = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    });
}
