use std::sync::Once;

use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

static INIT: Once = Once::new();

/// Install the global subscriber: `RUST_LOG` filtering (default `info`)
/// with bunyan-formatted JSON lines on stdout. Only the first call takes
/// effect; the server, the CLI, and tests all funnel through here.
pub fn configure(service_name: impl Into<String>) {
    let service_name = service_name.into();
    INIT.call_once(move || {
        // Bridge `log` records from the reqwest/hyper client stack into
        // tracing, minus their per-connection chatter.
        LogTracer::builder()
            .ignore_crate("hyper")
            .ignore_crate("reqwest")
            .ignore_crate("mio")
            .with_max_level(log::LevelFilter::Debug)
            .init()
            .expect("Installing log bridge");

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new(service_name, std::io::stdout));
        set_global_default(subscriber).expect("Installing tracing subscriber");
    });
}
