// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Validated runtime configuration (§10.1).
//!
//! Grouped into small sub-structs built from parsed CLI flags rather than a
//! YAML document: the CLI surface in §6.3 *is* the configuration surface
//! here.

use std::net::SocketAddr;

use crate::{
    cfg::cli::RawArgs,
    error::ConfigError,
    job::backpressure::{HIGH_WATER, LOW_WATER},
    transport::puic::PuicConfig,
    Role,
};

/// Listen addresses a binary binds TCP (agent) or PUIC (proxy) to.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub addrs: Vec<SocketAddr>,
}

/// The single upstream a binary forwards tunneled bytes to: the agent's
/// local forwarder, or the proxy's backend TCP target.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub addr: SocketAddr,
}

/// The backpressure watermarks (§4.9). Exposed as config rather than baked
/// in purely so validation has something concrete to check
/// (`low < high`); neither binary's CLI currently overrides the defaults.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub low_water: usize,
    pub high_water: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            low_water: LOW_WATER,
            high_water: HIGH_WATER,
        }
    }
}

/// Fully validated configuration for one running process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub role: Role,
    pub listen: ListenConfig,
    pub forward: ForwardConfig,
    pub outgoing_bind: Option<SocketAddr>,
    pub puic: PuicConfig,
    pub backpressure: BackpressureConfig,
    pub use_proxy_protocol: bool,
}

impl RuntimeConfig {
    /// Builds and validates a [`RuntimeConfig`] from parsed CLI flags:
    /// required fields present, counts in range, watermarks sane.
    pub fn from_args(role: Role, args: RawArgs) -> Result<Self, ConfigError> {
        if args.listen.is_empty() {
            return Err(ConfigError::MissingFlag("-l"));
        }
        if args.listen.len() > crate::cfg::cli::MAX_LISTEN_ADDRS {
            return Err(ConfigError::TooManyListeners(args.listen.len()));
        }
        let forward = args.forward.ok_or(ConfigError::MissingFlag("-f"))?;

        let backpressure = BackpressureConfig::default();
        if backpressure.low_water >= backpressure.high_water {
            return Err(ConfigError::BadWatermarks {
                low: backpressure.low_water,
                high: backpressure.high_water,
            });
        }

        let mut puic = PuicConfig::default();
        if let Some(bind) = args.outgoing_bind {
            puic.bind_addr = bind;
        }

        Ok(Self {
            role,
            listen: ListenConfig { addrs: args.listen },
            forward: ForwardConfig { addr: forward },
            outgoing_bind: args.outgoing_bind,
            puic,
            backpressure,
            use_proxy_protocol: args.use_proxy_protocol,
        })
    }
}
