// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! mai-bus Hub
//!
//! Runs a mai-bus service with:
//! - api-key authentication from `MAIBUS_API_KEYS`
//! - relaying of standard messages between users
//! - HTTP endpoints for health checks and Prometheus metrics

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use mai_bus::Service;
use mai_bus_hub::auth::ApiKeyTable;
use mai_bus_hub::config::HubConfig;
use mai_bus_hub::http::{create_router, HttpState};
use mai_bus_hub::metrics::HubMetrics;
use mai_bus_hub::relay::Relay;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mai_bus=info".parse()?)
                .add_directive("mai_bus_hub=info".parse()?),
        )
        .init();

    let config = HubConfig::from_env();
    info!("Starting mai-bus hub v{}", env!("CARGO_PKG_VERSION"));
    if config.api_keys.is_empty() {
        warn!("MAIBUS_API_KEYS is empty; every api key is accepted");
    } else {
        info!("Loaded {} api keys", config.api_keys.len());
    }

    let metrics = HubMetrics::new()?;
    let keys = ApiKeyTable::new(config.api_keys.clone());
    let relay = Relay::new(keys.clone(), metrics.clone());
    let handler = relay.clone();

    let service = Service::builder(config.service.clone())
        .hooks(keys)
        .on_message(move |message, ctx| {
            let relay = handler.clone();
            async move { relay.handle(message, ctx).await }
        })
        .on_unhandled(|envelope, reason, ctx| async move {
            let from = ctx.and_then(|c| c.user_id).unwrap_or_default();
            warn!("Unhandled {} from {:?}: {}", envelope.msg_type, from, reason);
            Ok(())
        })
        .on_stats(|stats| {
            info!(
                "Stats: {} active connections, {} received, {} sent, {} cached",
                stats.connections_active,
                stats.messages_received,
                stats.messages_sent,
                stats.messages_cached
            );
        })
        .start()
        .await?;
    let service = Arc::new(service);
    relay.attach(service.clone());
    info!("WebSocket: {}", service.local_addr());

    let http_state = HttpState {
        metrics,
        service: service.clone(),
        start_time: Instant::now(),
        metrics_token: config.metrics_token.clone(),
    };
    let http_addr = config.http_addr();
    let http_listener = TcpListener::bind(&http_addr).await?;
    let http_router = create_router(http_state);
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.stop().await;
    Ok(())
}
