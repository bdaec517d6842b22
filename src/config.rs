// Copyright 2024 Event Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Typed configuration for the relayer.
//!
//! The configuration is a single JSON file. String values may embed
//! `${VAR}` or `${VAR:default}` placeholders which are resolved against the
//! process environment before the file is parsed. A post-load validation
//! pass aggregates every configuration problem into a single error so a
//! broken deployment fails loudly at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{EventSignature, MethodSignature};
use crate::error::{Error, Result};

/// Hex value of an all-zero private key, used as the development fallback
/// for the `${PRIVATE_KEY}` placeholder.
const ZERO_PRIVATE_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const fn default_poll_interval() -> u64 {
    5_000
}

const fn default_gas_multiplier() -> f64 {
    1.0
}

const fn default_proof_timeout_ms() -> u64 {
    30_000
}

const fn default_proof_retry_attempts() -> u32 {
    3
}

const fn enabled_default() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./relayer-store")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// RelayerConfig is the top-level configuration of the relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerConfig {
    /// Configured networks, a map between chain name and its configuration.
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    /// Known contracts: contract name to per-chain deployment.
    #[serde(default)]
    pub contracts: HashMap<String, HashMap<String, ContractDeployment>>,
    /// The relay rules binding source events to destination calls.
    #[serde(default)]
    pub event_mappings: Vec<EventMappingConfig>,
    /// Named destination resolvers referenced by the mappings.
    #[serde(default)]
    pub destination_resolvers: HashMap<String, ResolverSpec>,
    /// The external proof service.
    pub proof_api: ProofApiConfig,
    /// Where the job and chain-state database lives.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Log level and optional file logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// ChainConfig is the configuration of a single network.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Numeric chain id, also sent to the proof service.
    pub chain_id: u64,
    /// Http(s) RPC endpoint.
    #[serde(skip_serializing)]
    pub rpc_endpoint: Url,
    /// The private key used to sign destination transactions on this chain.
    /// A raw 32-byte hex string, with or without the `0x` prefix; usually
    /// injected through the `${PRIVATE_KEY}` placeholder.
    #[serde(default, skip_serializing)]
    pub private_key: Option<PrivateKey>,
    /// Sweep interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Confirmation depth: only blocks at `head - confirmations` or lower
    /// are swept, and destination transactions wait this many
    /// confirmations.
    #[serde(default)]
    pub confirmations: u64,
    /// Multiplier applied to gas estimates before submission.
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    /// Optional EIP-1559 fee ceiling, in wei.
    #[serde(default)]
    pub max_fee_per_gas: Option<u64>,
    /// Optional EIP-1559 priority fee, in wei.
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<u64>,
}

/// One contract deployment on one chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDeployment {
    /// The on-chain address.
    pub address: Address,
    /// Whether this deployment is observed, called, or both.
    pub role: ContractRole,
    /// Optional path to a full ABI file. The relayer only needs the
    /// signatures declared on the mappings; the ABI is kept for tooling.
    #[serde(default)]
    pub abi: Option<PathBuf>,
}

/// The role a contract plays on a given chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractRole {
    /// Events are observed from this deployment.
    Source,
    /// Methods are invoked on this deployment.
    Destination,
    /// Both of the above.
    Both,
}

impl ContractRole {
    /// Whether events may be observed from this deployment.
    pub fn is_source(&self) -> bool {
        matches!(self, ContractRole::Source | ContractRole::Both)
    }

    /// Whether methods may be invoked on this deployment.
    pub fn is_destination(&self) -> bool {
        matches!(self, ContractRole::Destination | ContractRole::Both)
    }
}

/// A relay rule: one source event wired to one destination call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMappingConfig {
    /// Stable identifier, used as a tag on jobs.
    pub name: String,
    /// The observed event.
    pub source_event: SourceEventConfig,
    /// The invoked method.
    pub destination_call: DestinationCallConfig,
    /// Name of the resolver deciding the destination chains.
    pub destination_resolver: String,
    /// Whether an inclusion proof must be fetched before execution.
    #[serde(default)]
    pub proof_required: bool,
    /// Disabled mappings are dropped at load time.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

/// The source half of a mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEventConfig {
    /// Contract name, resolved against the `contracts` table.
    pub contract: String,
    /// Event schema, e.g. `ValueSet(bytes32 indexed key, bytes value)`.
    pub signature: String,
}

/// The destination half of a mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationCallConfig {
    /// Contract name, resolved against the `contracts` table.
    pub contract: String,
    /// Method schema, e.g. `setValue(bytes proof, bytes32 key, bytes value)`.
    pub signature: String,
}

/// A destination resolver specification.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResolverSpec {
    /// A fixed, ordered set of destination chains.
    #[serde(rename_all = "camelCase")]
    Static {
        /// Destination chain names; the source chain is filtered out.
        destinations: Vec<String>,
    },
    /// The destination is read from an event parameter, optionally through
    /// a lookup table keyed by the parameter's stringified value.
    #[serde(rename_all = "camelCase")]
    EventParameter {
        /// The event parameter carrying the destination.
        parameter_name: String,
        /// Optional value-to-chain-name table.
        #[serde(default)]
        mapping: Option<HashMap<String, String>>,
    },
    /// Dispatch to a function registered at startup.
    #[serde(rename_all = "camelCase")]
    Custom {
        /// Registry key of the function.
        function_id: String,
    },
}

/// Connection settings for the external proof service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofApiConfig {
    /// JSON-RPC endpoint of the proof service.
    pub base_url: Url,
    /// Per-request timeout in milliseconds.
    #[serde(rename = "timeout_ms", default = "default_proof_timeout_ms")]
    pub timeout_ms: u64,
    /// How many times the request phase is retried.
    #[serde(default = "default_proof_retry_attempts")]
    pub retry_attempts: u32,
    /// Optional bearer token.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

/// Where the embedded database lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Directory of the sled database.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Log level and file logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level directive, e.g. `info` or `debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to also write logs to a file.
    #[serde(default)]
    pub enable_file_logging: bool,
    /// Path of the log file, when file logging is enabled.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            enable_file_logging: false,
            log_path: None,
        }
    }
}

/// A 32-byte signing key, parsed from hex.
#[derive(Clone)]
pub struct PrivateKey(H256);

impl PrivateKey {
    /// The raw key bytes.
    pub fn as_fixed_bytes(&self) -> &[u8; 32] {
        self.0.as_fixed_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").finish()
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVisitor;
        impl serde::de::Visitor<'_> for PrivateKeyVisitor {
            type Value = H256;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a 64 character hex string, 0x prefix optional")
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let stripped = value.strip_prefix("0x").unwrap_or(value);
                H256::from_str(stripped).map_err(|e| {
                    serde::de::Error::custom(format!(
                        "{e}; expected a 64 character hex string but got {} chars",
                        stripped.len()
                    ))
                })
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVisitor)?;
        Ok(Self(secret))
    }
}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("<redacted>")
    }
}

/// Resolves `${VAR}` and `${VAR:default}` placeholders against the process
/// environment. Warnings are pushed onto `warnings` so the caller can emit
/// them once the logger is up.
///
/// `${PRIVATE_KEY}` gets special handling: the value is read from the
/// `PRIVATE_KEY` environment variable, a `0x` prefix is added if missing,
/// and an all-zero development key is substituted when the variable is
/// absent.
pub fn substitute_env(raw: &str, warnings: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // unterminated placeholder, keep it literally.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let placeholder = &after[..end];
        let (name, default) = match placeholder.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (placeholder, None),
        };
        out.push_str(&resolve_placeholder(name, default, warnings));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_placeholder(name: &str, default: Option<&str>, warnings: &mut Vec<String>) -> String {
    if name == "PRIVATE_KEY" {
        let value = match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                warnings.push(
                    "PRIVATE_KEY is not set, falling back to an all-zero development key"
                        .to_string(),
                );
                ZERO_PRIVATE_KEY.to_string()
            }
        };
        return if value.starts_with("0x") {
            value
        } else {
            format!("0x{value}")
        };
    }
    match std::env::var(name) {
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                warnings.push(format!(
                    "environment variable {name} is not set and has no default, substituting an empty string"
                ));
                String::new()
            }
        },
    }
}

/// Loads the configuration from a JSON file, returning the parsed config
/// plus any substitution warnings to emit.
pub fn load_with_warnings<P: AsRef<Path>>(path: P) -> Result<(RelayerConfig, Vec<String>)> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let mut warnings = Vec::new();
    let substituted = substitute_env(&raw, &mut warnings);
    let mut deserializer = serde_json::Deserializer::from_str(&substituted);
    let parsed: std::result::Result<RelayerConfig, serde_path_to_error::Error<serde_json::Error>> =
        serde_path_to_error::deserialize(&mut deserializer);
    match parsed {
        Ok(config) => Ok((postloading_process(config)?, warnings)),
        Err(e) => Err(e.into()),
    }
}

/// Loads the configuration from a JSON file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<RelayerConfig> {
    let (config, warnings) = load_with_warnings(path)?;
    for warning in warnings {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

/// The postloading_process exists to validate the configuration and drop
/// disabled mappings. All problems are aggregated into a single error.
pub fn postloading_process(mut config: RelayerConfig) -> Result<RelayerConfig> {
    tracing::trace!("Checking configuration sanity ...");
    let before = config.event_mappings.len();
    config.event_mappings.retain(|m| m.enabled);
    if config.event_mappings.len() != before {
        tracing::debug!(
            dropped = before - config.event_mappings.len(),
            "dropped disabled event mappings",
        );
    }

    let mut problems = Vec::new();
    for mapping in &config.event_mappings {
        if let Err(e) = EventSignature::parse(&mapping.source_event.signature) {
            problems.push(format!("mapping {}: {e}", mapping.name));
        }
        if let Err(e) = MethodSignature::parse(&mapping.destination_call.signature) {
            problems.push(format!("mapping {}: {e}", mapping.name));
        }
        match config.contracts.get(&mapping.source_event.contract) {
            None => problems.push(format!(
                "mapping {}: unknown source contract {}",
                mapping.name, mapping.source_event.contract
            )),
            Some(deployments) => {
                let observable = deployments.iter().any(|(chain, dep)| {
                    dep.role.is_source() && config.chains.contains_key(chain)
                });
                if !observable {
                    problems.push(format!(
                        "mapping {}: contract {} is not a source on any configured chain",
                        mapping.name, mapping.source_event.contract
                    ));
                }
            }
        }
        if !config.contracts.contains_key(&mapping.destination_call.contract) {
            problems.push(format!(
                "mapping {}: unknown destination contract {}",
                mapping.name, mapping.destination_call.contract
            ));
        }
        if !config
            .destination_resolvers
            .contains_key(&mapping.destination_resolver)
        {
            problems.push(format!(
                "mapping {}: unknown resolver {}",
                mapping.name, mapping.destination_resolver
            ));
        }
    }
    for (chain_name, chain) in &config.chains {
        if chain.gas_multiplier <= 0.0 {
            problems.push(format!(
                "chain {chain_name}: gasMultiplier must be greater than zero"
            ));
        }
    }
    // deployments on chains that are not configured are suspicious but not
    // fatal; the operator may be rolling chains out one at a time.
    for (contract, deployments) in &config.contracts {
        for chain_name in deployments.keys() {
            if !config.chains.contains_key(chain_name) {
                tracing::warn!(
                    "contract {} is deployed on {}, which is not a configured chain",
                    contract,
                    chain_name,
                );
            }
        }
    }

    if problems.is_empty() {
        Ok(config)
    } else {
        Err(Error::InvalidConfig(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // tests touching PRIVATE_KEY serialise on this lock; cargo runs tests
    // in parallel and the environment is process-global.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"{
        "chains": {
            "base": {
                "chainId": 84532,
                "rpcEndpoint": "http://localhost:8545",
                "privateKey": "${PRIVATE_KEY}",
                "pollInterval": 1000,
                "confirmations": 2,
                "gasMultiplier": 1.2
            },
            "arbitrum": {
                "chainId": 421614,
                "rpcEndpoint": "http://localhost:8546",
                "maxFeePerGas": 2000000000,
                "maxPriorityFeePerGas": 1000000000
            }
        },
        "contracts": {
            "Store": {
                "base": { "address": "0x00000000000000000000000000000000000000aa", "role": "source" },
                "arbitrum": { "address": "0x00000000000000000000000000000000000000bb", "role": "destination" }
            }
        },
        "eventMappings": [
            {
                "name": "value-set",
                "sourceEvent": { "contract": "Store", "signature": "ValueSet(bytes32 key, bytes value)" },
                "destinationCall": { "contract": "Store", "signature": "setValue(bytes proof, bytes32 key, bytes value)" },
                "destinationResolver": "to-arbitrum",
                "proofRequired": true
            }
        ],
        "destinationResolvers": {
            "to-arbitrum": { "type": "static", "destinations": ["arbitrum"] }
        },
        "proofApi": { "baseUrl": "https://proofs.example.com/", "timeout_ms": 10000, "retryAttempts": 2 },
        "database": { "path": "/tmp/relayer-test-db" },
        "logging": { "level": "debug" }
    }"#;

    #[test]
    fn loads_a_complete_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        let file = write_config(SAMPLE);
        let (config, _warnings) = load_with_warnings(file.path()).unwrap();
        assert_eq!(config.chains.len(), 2);
        let base = &config.chains["base"];
        assert_eq!(base.chain_id, 84532);
        assert_eq!(base.confirmations, 2);
        assert!(base.private_key.is_some());
        assert_eq!(config.chains["arbitrum"].poll_interval, 5_000);
        assert_eq!(config.event_mappings.len(), 1);
        assert!(config.event_mappings[0].proof_required);
        assert_eq!(config.proof_api.retry_attempts, 2);
    }

    #[test]
    fn missing_private_key_falls_back_to_zero_key_with_warning() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("PRIVATE_KEY");
        let mut warnings = Vec::new();
        let out = substitute_env(r#"{"k":"${PRIVATE_KEY}"}"#, &mut warnings);
        assert!(out.contains(&format!("0x{ZERO_PRIVATE_KEY}")));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn private_key_gets_a_0x_prefix() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PRIVATE_KEY", "11".repeat(32));
        let mut warnings = Vec::new();
        let out = substitute_env("${PRIVATE_KEY}", &mut warnings);
        assert_eq!(out, format!("0x{}", "11".repeat(32)));
        assert!(warnings.is_empty());
        std::env::remove_var("PRIVATE_KEY");
    }

    #[test]
    fn placeholders_resolve_with_defaults() {
        std::env::set_var("RELAYER_TEST_SET_VAR", "hello");
        let mut warnings = Vec::new();
        let out = substitute_env(
            "${RELAYER_TEST_SET_VAR} ${RELAYER_TEST_UNSET_VAR:fallback} ${RELAYER_TEST_MISSING_VAR}",
            &mut warnings,
        );
        assert_eq!(out, "hello fallback ");
        assert_eq!(warnings.len(), 1);
        std::env::remove_var("RELAYER_TEST_SET_VAR");
    }

    #[test]
    fn unterminated_placeholder_is_kept_literally() {
        let mut warnings = Vec::new();
        let out = substitute_env("prefix ${UNTERMINATED", &mut warnings);
        assert_eq!(out, "prefix ${UNTERMINATED");
    }

    #[test]
    fn validation_aggregates_every_problem() {
        let json = SAMPLE
            .replace("to-arbitrum\",", "no-such-resolver\",")
            .replace("\"contract\": \"Store\", \"signature\": \"ValueSet", "\"contract\": \"Ghost\", \"signature\": \"ValueSet");
        let file = write_config(&json);
        let err = load_with_warnings(file.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown source contract Ghost"), "{message}");
        assert!(message.contains("unknown resolver no-such-resolver"), "{message}");
    }

    #[test]
    fn disabled_mappings_are_dropped() {
        let json = SAMPLE.replace(
            "\"proofRequired\": true",
            "\"proofRequired\": true, \"enabled\": false",
        );
        let file = write_config(&json);
        let (config, _) = load_with_warnings(file.path()).unwrap();
        assert!(config.event_mappings.is_empty());
    }
}
