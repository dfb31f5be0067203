// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read from the environment once at startup into
//! [`AppConfig`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for claims, sessions and the work database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `TLS_CERT_PATH` / `TLS_KEY_PATH` | PEM certificate chain and key; plain HTTP when unset | unset |
//! | `SETTLEMENT_TICK_SECS` | Interval of the claim/session processing tick | `60` |
//! | `ATTESTATION_SWEEP_SECS` | Interval of the attestation retry sweep | `600` |
//! | `LOCK_TTL_SECS` | Per-item lock expiry | `60` |
//! | `INTENT_MAX_AGE_DAYS` | Intents older than this expire | `30` |
//! | `QUOTE_PROVIDER_URL` | Base URL of the quote & swap provider | unset |
//! | `QUOTE_PROVIDER_API_KEY` | Bearer token for the provider | unset |
//! | `PRICE_API_URL` | USD price feed (`GET {url}?symbol=ETH`) | unset |
//! | `PRICE_USD_<SYMBOL>` | Static USD price override, e.g. `PRICE_USD_ETH=2500` | unset |
//! | `TREASURY_ADDRESS` | Recipient of companion-session fees | unset |
//! | `FEE_BPS` | Treasury fee on companion swaps, basis points | `100` |
//! | `DEPOSIT_BUFFER_BPS` | Slippage/gas buffer on the deposit ask | `300` |
//! | `GAS_RESERVE_WEI` | Native balance kept back for gas | `500000000000000` |
//! | `SESSION_MAX_ATTEMPTS` | Execution attempts before a session fails | `3` |
//! | `GAS_SPONSOR_KEY_PATH` | PKCS#8 PEM key funding gas of ERC-20 source sessions | unset (ERC-20 sources rejected) |
//! | `RPC_URL_<CHAIN_ID>` | RPC override per chain, e.g. `RPC_URL_8453` | public RPC |
//! | `ATTESTATION_CONTRACT` | Attestation ledger contract address | unset (ledger disabled) |
//! | `ATTESTATION_CHAIN_ID` | Chain of the attestation contract | `43113` |
//! | `ATTESTATION_SIGNER_KEY_PATH` | PKCS#8 PEM key that signs attestation txs | unset |

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";
pub const SETTLEMENT_TICK_SECS_ENV: &str = "SETTLEMENT_TICK_SECS";
pub const ATTESTATION_SWEEP_SECS_ENV: &str = "ATTESTATION_SWEEP_SECS";
pub const LOCK_TTL_SECS_ENV: &str = "LOCK_TTL_SECS";
pub const INTENT_MAX_AGE_DAYS_ENV: &str = "INTENT_MAX_AGE_DAYS";
pub const QUOTE_PROVIDER_URL_ENV: &str = "QUOTE_PROVIDER_URL";
pub const QUOTE_PROVIDER_API_KEY_ENV: &str = "QUOTE_PROVIDER_API_KEY";
pub const PRICE_API_URL_ENV: &str = "PRICE_API_URL";
pub const PRICE_USD_PREFIX: &str = "PRICE_USD_";
pub const TREASURY_ADDRESS_ENV: &str = "TREASURY_ADDRESS";
pub const FEE_BPS_ENV: &str = "FEE_BPS";
pub const DEPOSIT_BUFFER_BPS_ENV: &str = "DEPOSIT_BUFFER_BPS";
pub const GAS_RESERVE_WEI_ENV: &str = "GAS_RESERVE_WEI";
pub const SESSION_MAX_ATTEMPTS_ENV: &str = "SESSION_MAX_ATTEMPTS";
pub const GAS_SPONSOR_KEY_PATH_ENV: &str = "GAS_SPONSOR_KEY_PATH";
pub const RPC_URL_PREFIX: &str = "RPC_URL_";
pub const ATTESTATION_CONTRACT_ENV: &str = "ATTESTATION_CONTRACT";
pub const ATTESTATION_CHAIN_ID_ENV: &str = "ATTESTATION_CHAIN_ID";
pub const ATTESTATION_SIGNER_KEY_PATH_ENV: &str = "ATTESTATION_SIGNER_KEY_PATH";

const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TICK_SECS: u64 = 60;
const DEFAULT_SWEEP_SECS: u64 = 600;
const DEFAULT_LOCK_TTL_SECS: u64 = 60;
const DEFAULT_INTENT_MAX_AGE_DAYS: i64 = 30;
const DEFAULT_FEE_BPS: u32 = 100;
const DEFAULT_DEPOSIT_BUFFER_BPS: u32 = 300;
const DEFAULT_GAS_RESERVE_WEI: u128 = 500_000_000_000_000;
const DEFAULT_SESSION_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_ATTESTATION_CHAIN_ID: u64 = 43113;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: String, value: String },

    #[error("{0} is required")]
    Missing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AttestationConfig {
    pub contract: String,
    pub chain_id: u64,
    pub signer_key_path: PathBuf,
}

/// Companion wallet money policy.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub treasury_address: Option<String>,
    pub fee_bps: u32,
    pub deposit_buffer_bps: u32,
    pub gas_reserve_wei: u128,
    pub max_attempts: u32,
    /// Key that tops up native gas on sessions funded in an ERC-20 token.
    pub gas_sponsor_key_path: Option<PathBuf>,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            treasury_address: None,
            fee_bps: DEFAULT_FEE_BPS,
            deposit_buffer_bps: DEFAULT_DEPOSIT_BUFFER_BPS,
            gas_reserve_wei: DEFAULT_GAS_RESERVE_WEI,
            max_attempts: DEFAULT_SESSION_MAX_ATTEMPTS,
            gas_sponsor_key_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub tls: Option<TlsPaths>,
    pub settlement_tick: Duration,
    pub attestation_sweep: Duration,
    pub lock_ttl: Duration,
    pub intent_max_age: chrono::Duration,
    pub quote_provider_url: Option<String>,
    pub quote_provider_api_key: Option<String>,
    pub price_api_url: Option<String>,
    /// Upper-cased symbol → USD price.
    pub static_prices: HashMap<String, Decimal>,
    pub rpc_urls: HashMap<u64, String>,
    pub companion: CompanionConfig,
    pub attestation: Option<AttestationConfig>,
}

impl AppConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let env = Vars(vars);

        let log_format = match env.optional(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") | None => LogFormat::Pretty,
            Some(other) => return Err(invalid(LOG_FORMAT_ENV, other)),
        };

        let tls = match (env.optional(TLS_CERT_PATH_ENV), env.optional(TLS_KEY_PATH_ENV)) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing(TLS_KEY_PATH_ENV.to_string())),
            (None, Some(_)) => return Err(ConfigError::Missing(TLS_CERT_PATH_ENV.to_string())),
        };

        let attestation = match env.optional(ATTESTATION_CONTRACT_ENV) {
            Some(contract) => Some(AttestationConfig {
                contract,
                chain_id: env.parse_or(ATTESTATION_CHAIN_ID_ENV, DEFAULT_ATTESTATION_CHAIN_ID)?,
                signer_key_path: env
                    .optional(ATTESTATION_SIGNER_KEY_PATH_ENV)
                    .ok_or_else(|| {
                        ConfigError::Missing(ATTESTATION_SIGNER_KEY_PATH_ENV.to_string())
                    })?
                    .into(),
            }),
            None => None,
        };

        let mut static_prices = HashMap::new();
        let mut rpc_urls = HashMap::new();
        for (name, value) in vars {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if let Some(symbol) = name.strip_prefix(PRICE_USD_PREFIX) {
                let price: Decimal = value.parse().map_err(|_| invalid(name, value))?;
                static_prices.insert(symbol.to_uppercase(), price);
            } else if let Some(chain) = name.strip_prefix(RPC_URL_PREFIX) {
                let chain_id: u64 = chain.parse().map_err(|_| invalid(name, value))?;
                rpc_urls.insert(chain_id, value.to_string());
            }
        }

        let max_attempts = env.parse_or(SESSION_MAX_ATTEMPTS_ENV, DEFAULT_SESSION_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(invalid(SESSION_MAX_ATTEMPTS_ENV, "0"));
        }

        Ok(Self {
            data_dir: env.or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR).into(),
            host: env.or_default(HOST_ENV, DEFAULT_HOST),
            port: env.parse_or(PORT_ENV, DEFAULT_PORT)?,
            log_format,
            tls,
            settlement_tick: Duration::from_secs(
                env.parse_or(SETTLEMENT_TICK_SECS_ENV, DEFAULT_TICK_SECS)?,
            ),
            attestation_sweep: Duration::from_secs(
                env.parse_or(ATTESTATION_SWEEP_SECS_ENV, DEFAULT_SWEEP_SECS)?,
            ),
            lock_ttl: Duration::from_secs(env.parse_or(LOCK_TTL_SECS_ENV, DEFAULT_LOCK_TTL_SECS)?),
            intent_max_age: chrono::Duration::days(
                env.parse_or(INTENT_MAX_AGE_DAYS_ENV, DEFAULT_INTENT_MAX_AGE_DAYS)?,
            ),
            quote_provider_url: env.optional(QUOTE_PROVIDER_URL_ENV),
            quote_provider_api_key: env.optional(QUOTE_PROVIDER_API_KEY_ENV),
            price_api_url: env.optional(PRICE_API_URL_ENV),
            static_prices,
            rpc_urls,
            companion: CompanionConfig {
                treasury_address: env.optional(TREASURY_ADDRESS_ENV),
                fee_bps: env.parse_or(FEE_BPS_ENV, DEFAULT_FEE_BPS)?,
                deposit_buffer_bps: env.parse_or(DEPOSIT_BUFFER_BPS_ENV, DEFAULT_DEPOSIT_BUFFER_BPS)?,
                gas_reserve_wei: env.parse_or(GAS_RESERVE_WEI_ENV, DEFAULT_GAS_RESERVE_WEI)?,
                max_attempts,
                gas_sponsor_key_path: env.optional(GAS_SPONSOR_KEY_PATH_ENV).map(PathBuf::from),
            },
            attestation,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Trimmed, non-empty lookups over a variable map.
struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or_default(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(name) {
            Some(value) => value.parse().map_err(|_| invalid(name, &value)),
            None => Ok(default),
        }
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
    }
}
