// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza echo - loopback endpoint for protocol conformance testing.
//!
//! Every well-formed message it receives is written back unchanged.

use anyhow::Result;
use tracing::info;

use cadenza_protocol::{ProtocolServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadenza_protocol=info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env();
    info!(
        addr = %config.bind_addr,
        max_connections = config.max_connections,
        "Starting cadenza echo server"
    );

    let server = ProtocolServer::bind(config).await?;

    tokio::select! {
        result = server.run_echo() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    info!("Cadenza echo server stopped");
    Ok(())
}
