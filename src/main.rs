use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;

use naiveswitch::api::log_ring::{LogRing, RingLayer, LOG_RING_CAPACITY};
use naiveswitch::app::App;
use naiveswitch::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();

    if cfg.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let ring = Arc::new(LogRing::new(LOG_RING_CAPACITY));

    let default_level = if cfg.debug { "debug" } else { "info" };
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
    );

    // The ring only captures when -d is given; /api/logs stays empty
    // otherwise.
    let registry = tracing_subscriber::registry().with(fmt_layer);
    if cfg.debug {
        registry.with(RingLayer::new(ring.clone())).init();
    } else {
        registry.init();
    }

    info!("naiveswitch starting...");

    cfg.validate()?;

    App::new(cfg, ring)?.run().await
}
