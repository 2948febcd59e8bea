//! Tracing subscriber setup for the CLI binary (§10.1, §10.3). A single
//! stderr `fmt` layer with an `EnvFilter`; no OTLP export path, since the
//! core engine has no metrics/exporter Non-goal to honor here.

use tracing_subscriber::{EnvFilter, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing(default_directive: impl Into<Directive>) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_directive.into())
                .from_env_lossy(),
        )
        .init();
}
