// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration.
//!
//! Everything the dispatcher and the delivery client need is resolved once
//! into a [`Config`] and threaded into their constructors. [`Config::from_env`]
//! reads the process environment; [`Config::from_lookup`] takes any lookup
//! function so tests never touch global state.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::backoff::ExponentialBackoff;
use crate::batch::BatchLimits;
use crate::constants;
use crate::errors::ConfigError;
use crate::labels::{is_valid_label_name, LabelSet};

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => write!(f, "Bearer(***)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Loki push endpoint, e.g. `https://loki.example.com/loki/api/v1/push`.
    pub write_address: Url,
    pub credentials: Option<Credentials>,
    /// Sent as `X-Scope-OrgID`.
    pub tenant_id: Option<String>,
    /// Merged over every entry's labels.
    pub extra_labels: LabelSet,
    /// Removed from every entry's labels after merging.
    pub drop_labels: Vec<String>,
    pub batch_limits: BatchLimits,
    pub request_timeout: Duration,
    pub backoff: ExponentialBackoff,
    /// Deadline for one dispatch cycle, measured from its start.
    pub invocation_timeout: Option<Duration>,
    /// Expected `x-amz-firehose-access-key`; unchecked when unset.
    pub firehose_access_key: Option<String>,
    pub https_proxy: Option<String>,
    pub port: u16,
}

impl Config {
    /// A configuration with every optional setting at its default.
    #[must_use]
    pub fn new(write_address: Url) -> Self {
        Config {
            write_address,
            credentials: None,
            tenant_id: None,
            extra_labels: LabelSet::new(),
            drop_labels: Vec::new(),
            batch_limits: BatchLimits::default(),
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            backoff: ExponentialBackoff::default(),
            invocation_timeout: None,
            firehose_access_key: None,
            https_proxy: None,
            port: constants::DEFAULT_PORT,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let raw_address = get("WRITE_ADDRESS").ok_or(ConfigError::Missing("WRITE_ADDRESS"))?;
        let write_address = Url::parse(raw_address.trim()).map_err(|e| ConfigError::Invalid {
            name: "WRITE_ADDRESS",
            message: e.to_string(),
        })?;
        if !matches!(write_address.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "WRITE_ADDRESS",
                message: format!("unsupported scheme {}", write_address.scheme()),
            });
        }

        let credentials = match (get("BEARER_TOKEN"), get("USERNAME"), get("PASSWORD")) {
            (Some(token), _, _) => Some(Credentials::Bearer(token)),
            (None, Some(username), Some(password)) => Some(Credentials::Basic { username, password }),
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(ConfigError::Invalid {
                    name: "USERNAME",
                    message: "USERNAME and PASSWORD must be set together".to_string(),
                })
            }
            (None, None, None) => None,
        };

        let omit_prefix = get("OMIT_EXTRA_LABELS_PREFIX")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));
        let extra_labels = match get("EXTRA_LABELS") {
            Some(raw) => parse_extra_labels(&raw, omit_prefix)?,
            None => LabelSet::new(),
        };
        let drop_labels = match get("DROP_LABELS") {
            Some(raw) => parse_drop_labels(&raw)?,
            None => Vec::new(),
        };

        let defaults = BatchLimits::default();
        let batch_limits = BatchLimits {
            max_bytes: parse_var(&get, "BATCH_SIZE")?.unwrap_or(defaults.max_bytes),
            max_entries: parse_var(&get, "BATCH_MAX_ENTRIES")?.unwrap_or(defaults.max_entries),
            max_age: parse_var(&get, "BATCH_MAX_AGE_SECS")?.map(Duration::from_secs),
        };

        let backoff_defaults = ExponentialBackoff::default();
        let backoff = ExponentialBackoff {
            min: parse_var(&get, "BACKOFF_MIN_MS")?
                .map_or(backoff_defaults.min, Duration::from_millis),
            max: parse_var(&get, "BACKOFF_MAX_MS")?
                .map_or(backoff_defaults.max, Duration::from_millis),
            max_retries: parse_var(&get, "MAX_RETRIES")?.unwrap_or(backoff_defaults.max_retries),
        };

        Ok(Config {
            write_address,
            credentials,
            tenant_id: get("TENANT_ID"),
            extra_labels,
            drop_labels,
            batch_limits,
            request_timeout: parse_var(&get, "REQUEST_TIMEOUT_SECS")?
                .map_or(constants::DEFAULT_REQUEST_TIMEOUT, Duration::from_secs),
            backoff,
            invocation_timeout: parse_var(&get, "INVOCATION_TIMEOUT_SECS")?.map(Duration::from_secs),
            firehose_access_key: get("FIREHOSE_ACCESS_KEY"),
            https_proxy: get("HTTPS_PROXY"),
            port: parse_var(&get, "PORT")?.unwrap_or(constants::DEFAULT_PORT),
        })
    }
}

fn parse_var<T, G>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

/// Parses `name1,value1,name2,value2` into a label set.
fn parse_extra_labels(raw: &str, omit_prefix: bool) -> Result<LabelSet, ConfigError> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() % 2 != 0 {
        return Err(ConfigError::Invalid {
            name: "EXTRA_LABELS",
            message: "expected a comma separated list with an even number of entries".to_string(),
        });
    }

    let prefix = if omit_prefix {
        ""
    } else {
        constants::EXTRA_LABEL_PREFIX
    };
    let mut labels = LabelSet::new();
    for pair in parts.chunks_exact(2) {
        let name = format!("{prefix}{}", pair[0]);
        if !is_valid_label_name(&name) {
            return Err(ConfigError::Invalid {
                name: "EXTRA_LABELS",
                message: format!("invalid label name {name:?}"),
            });
        }
        labels = labels.with(name, pair[1]);
    }
    Ok(labels)
}

fn parse_drop_labels(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            if is_valid_label_name(name) {
                Ok(name.to_string())
            } else {
                Err(ConfigError::Invalid {
                    name: "DROP_LABELS",
                    message: format!("invalid label name {name:?}"),
                })
            }
        })
        .collect()
}
