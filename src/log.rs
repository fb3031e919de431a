use tracing_subscriber::{
    fmt::Layer, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Used when `RUST_LOG` is not set.
const DEFAULT_DIRECTIVES: &str = "info,gas_alert=debug";

/// JSON logs, one flattened object per event, filtered by `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::registry()
        .with(Layer::default().json().flatten_event(true))
        .with(filter)
        .init();
}
