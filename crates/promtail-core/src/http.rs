// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Construction of the HTTP client used to push to the sink.

use std::error::Error;
use std::time::Duration;

use tracing::error;

use crate::config::Config;

/// Builds the push client, falling back to a direct connection when the
/// proxy setting cannot be used.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!("Failed to build HTTP client without proxy: {inner}, using reqwest defaults");
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    // Per-request timeouts are set on each push so a caller deadline can shorten them.
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .user_agent(crate::constants::USER_AGENT)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(https_proxy)?);
        }
    }

    Ok(builder.build()?)
}
