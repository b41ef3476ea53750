// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use promtail_core::client::{LokiClient, Sink};
use promtail_core::config::Config;

mod server;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("PROMTAIL_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {e}. Shutting down.");
            return;
        }
    };

    info!(
        "Forwarding Firehose deliveries to {} on port {}",
        config.write_address, config.port
    );

    let sink: Arc<dyn Sink> = Arc::new(LokiClient::new(&config));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => debug!("Received shutdown signal"),
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
        signal_token.cancel();
    });

    if let Err(e) = server::serve(config, sink, shutdown).await {
        error!("Error when starting the Firehose listener: {e:?}");
    }
}
