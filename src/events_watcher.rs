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
//! Per-chain event listener.
//!
//! One listener runs per source chain. Each tick it advances a persisted
//! cursor through the finalised part of the chain (`head - confirmations`),
//! fetches matching logs for every active mapping, decodes them, consults
//! the destination resolver, and writes relay jobs. A failed tick never
//! advances the cursor, so the same range is retried on the next tick;
//! the `unique_id` constraint keeps re-observation idempotent.

use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Middleware;
use ethers::types::{Filter, Log, TransactionReceipt, H256};

use crate::codec::{self, EventSignature, MethodSignature};
use crate::config::{EventMappingConfig, RelayerConfig};
use crate::error::{Error, Result};
use crate::resolver::DestinationResolver;
use crate::store::{ChainStateStore, JobSpec, JobStore};

/// The sweep is capped at this many blocks per tick to bound memory and
/// request size.
pub const MAX_BLOCKS_PER_SWEEP: u64 = 100;

/// A small capability for fetching transaction receipts.
///
/// The queue needs receipts to translate filter-local log positions into
/// receipt-absolute indexes; depending on this trait instead of the
/// listener breaks the cycle between the two.
#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    /// The receipt of a mined transaction, `None` when unknown.
    async fn get_transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;
}

/// [`ChainRpc`] backed by an ethers provider.
pub struct ProviderChainRpc<M> {
    client: Arc<M>,
}

impl<M> ProviderChainRpc<M> {
    /// Wraps a provider.
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl<M: Middleware + 'static> ChainRpc for ProviderChainRpc<M> {
    async fn get_transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
        self.client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))
    }
}

/// An event mapping with its schemas parsed, ready for sweeping.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    /// Stable mapping name, tagged onto jobs.
    pub name: String,
    /// Name of the observed contract.
    pub source_contract: String,
    /// Parsed event schema.
    pub event: EventSignature,
    /// The log topic identifying the event.
    pub topic0: H256,
    /// Name of the called contract.
    pub dest_contract: String,
    /// Name of the called method.
    pub dest_method: String,
    /// Canonical method signature, stored on jobs.
    pub dest_method_signature: String,
    /// Name of the destination resolver.
    pub resolver: String,
    /// Whether jobs need an inclusion proof.
    pub proof_required: bool,
}

impl CompiledMapping {
    /// Parses a mapping's schemas. Fails on malformed signatures.
    pub fn compile(config: &EventMappingConfig) -> Result<Self> {
        let event = EventSignature::parse(&config.source_event.signature)?;
        let method = MethodSignature::parse(&config.destination_call.signature)?;
        let topic0 = event.topic0();
        Ok(Self {
            name: config.name.clone(),
            source_contract: config.source_event.contract.clone(),
            event,
            topic0,
            dest_contract: config.destination_call.contract.clone(),
            dest_method: method.name().to_string(),
            dest_method_signature: method.render(),
            resolver: config.destination_resolver.clone(),
            proof_required: config.proof_required,
        })
    }
}

struct WatchTarget {
    address: ethers::types::Address,
    mapping: Arc<CompiledMapping>,
}

/// A finalised-block event sweeper bound to a single source chain.
pub struct ChainListener<S, M> {
    chain_name: String,
    confirmations: u64,
    poll_interval: Duration,
    client: Arc<M>,
    store: Arc<S>,
    config: Arc<RelayerConfig>,
    resolver: Arc<DestinationResolver>,
    targets: Vec<WatchTarget>,
}

impl<S, M> ChainListener<S, M>
where
    S: JobStore + ChainStateStore + 'static,
    M: Middleware + 'static,
{
    /// Builds the listener for `chain_name`, compiling every enabled
    /// mapping whose source contract is deployed on the chain with a
    /// source role.
    pub fn new(
        chain_name: String,
        config: Arc<RelayerConfig>,
        client: Arc<M>,
        store: Arc<S>,
        resolver: Arc<DestinationResolver>,
    ) -> Result<Self> {
        let chain = config
            .chains
            .get(&chain_name)
            .ok_or_else(|| Error::ChainNotFound {
                chain: chain_name.clone(),
            })?;
        let mut targets = Vec::new();
        for mapping in &config.event_mappings {
            let deployment = config
                .contracts
                .get(&mapping.source_event.contract)
                .and_then(|deployments| deployments.get(&chain_name));
            let Some(deployment) = deployment else {
                continue;
            };
            if !deployment.role.is_source() {
                continue;
            }
            let compiled = Arc::new(CompiledMapping::compile(mapping)?);
            targets.push(WatchTarget {
                address: deployment.address,
                mapping: compiled,
            });
        }
        Ok(Self {
            chain_name,
            confirmations: chain.confirmations,
            poll_interval: Duration::from_millis(chain.poll_interval),
            client,
            store,
            config,
            resolver,
            targets,
        })
    }

    /// Whether any mapping observes this chain.
    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Returns a task that should be running in the background that will
    /// sweep the chain for events.
    #[tracing::instrument(skip_all, fields(chain = %self.chain_name))]
    pub async fn run(&self) -> Result<()> {
        let backoff = backoff::backoff::Constant::new(self.poll_interval);
        let task = || async {
            loop {
                if let Err(e) = self.sweep().await {
                    tracing::error!("sweep failed: {e}");
                    tracing::warn!("restarting event sweeper ...");
                    // transient by construction; the cursor did not move,
                    // so the same range is retried.
                    return Err(backoff::Error::transient(e));
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        backoff::future::retry(backoff, task).await
    }

    /// One sweep tick. Errors abort the tick without advancing the cursor.
    async fn sweep(&self) -> Result<()> {
        let head = self
            .client
            .get_block_number()
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?
            .as_u64();
        let safe = head.saturating_sub(self.confirmations);
        let last = match self.store.last_processed(&self.chain_name)? {
            Some(block) => block,
            None => {
                // first start: begin at the finality boundary.
                self.store.set_last_processed(&self.chain_name, safe)?;
                tracing::debug!(start = safe, head, "initialized sweep cursor");
                return Ok(());
            }
        };
        if safe <= last {
            tracing::trace!(head, safe, last, "no finalised blocks to sweep");
            return Ok(());
        }
        let from = last + 1;
        let to = cmp::min(safe, from + MAX_BLOCKS_PER_SWEEP - 1);
        tracing::trace!("sweeping #{from} to #{to}");

        for target in &self.targets {
            let filter = Filter::new()
                .address(target.address)
                .topic0(target.mapping.topic0)
                .from_block(from)
                .to_block(to);
            let logs = self
                .client
                .get_logs(&filter)
                .await
                .map_err(|e| Error::Rpc(e.to_string()))?;
            if !logs.is_empty() {
                tracing::debug!(
                    mapping = %target.mapping.name,
                    count = logs.len(),
                    "found matching events",
                );
            }
            self.record_jobs(target, logs)?;
        }

        self.store.set_last_processed(&self.chain_name, to)?;
        Ok(())
    }

    /// Decodes the matched logs and writes one job per (event, destination).
    fn record_jobs(&self, target: &WatchTarget, logs: Vec<Log>) -> Result<()> {
        let mapping = &target.mapping;
        // position of each log among its transaction's matches, in filter
        // order; this is the index stored on the job.
        let mut tx_positions: HashMap<H256, u64> = HashMap::new();
        for log in logs {
            let tx_hash = log.transaction_hash.unwrap_or_default();
            let position = tx_positions.entry(tx_hash).or_insert(0);
            let event_index = *position;
            *position += 1;

            let args = match codec::decode_event(&mapping.event.event, &log) {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!(
                        mapping = %mapping.name,
                        tx = ?tx_hash,
                        "failed to decode event, skipping: {e}",
                    );
                    continue;
                }
            };
            let event = crate::types::EventData {
                name: mapping.event.name().to_string(),
                args,
                block_number: log.block_number.unwrap_or_default().as_u64(),
                transaction_index: log.transaction_index.unwrap_or_default().as_u64(),
                log_index: event_index,
            };

            let destinations =
                match self
                    .resolver
                    .resolve(&mapping.name, &mapping.resolver, &event, &self.chain_name)
                {
                    Ok(destinations) => destinations,
                    Err(Error::Resolver(message)) => {
                        tracing::warn!(
                            mapping = %mapping.name,
                            %message,
                            "resolver rejected event, no job created",
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            if destinations.is_empty() {
                tracing::warn!(
                    mapping = %mapping.name,
                    "event resolved to no destinations, no job created",
                );
                continue;
            }

            for dest_chain in destinations {
                let deployment = self
                    .config
                    .contracts
                    .get(&mapping.dest_contract)
                    .and_then(|deployments| deployments.get(&dest_chain));
                let Some(deployment) = deployment else {
                    tracing::warn!(
                        mapping = %mapping.name,
                        contract = %mapping.dest_contract,
                        chain = %dest_chain,
                        "destination contract is not deployed on the resolved chain",
                    );
                    continue;
                };
                if !deployment.role.is_destination() {
                    tracing::warn!(
                        mapping = %mapping.name,
                        contract = %mapping.dest_contract,
                        chain = %dest_chain,
                        "resolved deployment is not a destination",
                    );
                    continue;
                }

                let unique_id = format!(
                    "{}:{:#x}:{}:{}",
                    self.chain_name, tx_hash, event_index, dest_chain
                );
                if self.store.find_by_unique_id(&unique_id)?.is_some() {
                    tracing::trace!(%unique_id, "event already recorded, skipping");
                    continue;
                }
                let spec = JobSpec {
                    unique_id: unique_id.clone(),
                    source_chain: self.chain_name.clone(),
                    source_tx_hash: tx_hash,
                    source_block_number: event.block_number,
                    dest_chain: dest_chain.clone(),
                    dest_address: deployment.address,
                    dest_method: mapping.dest_method.clone(),
                    dest_method_signature: mapping.dest_method_signature.clone(),
                    mapping_name: mapping.name.clone(),
                    event_data: event.clone(),
                    proof_required: mapping.proof_required,
                };
                match self.store.create_job(spec) {
                    Ok(id) => {
                        tracing::debug!(job = id, %unique_id, "relay job created");
                    }
                    Err(Error::DuplicateJob { .. }) => {
                        tracing::trace!(%unique_id, "duplicate job, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChainConfig, ContractDeployment, ContractRole, DestinationCallConfig, ProofApiConfig,
        ResolverSpec, SourceEventConfig,
    };
    use crate::resolver::ResolverRegistry;
    use crate::store::InMemoryStore;
    use crate::types::{EventValue, JobStatus};
    use ethers::abi::Token;
    use ethers::providers::{MockProvider, Provider};
    use ethers::types::{Address, U64};

    fn chain(chain_id: u64, confirmations: u64) -> ChainConfig {
        ChainConfig {
            chain_id,
            rpc_endpoint: "http://localhost:8545".parse().unwrap(),
            private_key: None,
            poll_interval: 1_000,
            confirmations,
            gas_multiplier: 1.0,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }

    fn test_config(confirmations: u64) -> Arc<RelayerConfig> {
        let mut chains = HashMap::new();
        chains.insert("base".to_string(), chain(84532, confirmations));
        chains.insert("arbitrum".to_string(), chain(421614, 0));

        let mut deployments = HashMap::new();
        deployments.insert(
            "base".to_string(),
            ContractDeployment {
                address: Address::repeat_byte(0x11),
                role: ContractRole::Source,
                abi: None,
            },
        );
        deployments.insert(
            "arbitrum".to_string(),
            ContractDeployment {
                address: Address::repeat_byte(0x22),
                role: ContractRole::Destination,
                abi: None,
            },
        );
        let mut contracts = HashMap::new();
        contracts.insert("Store".to_string(), deployments);

        let mut destination_resolvers = HashMap::new();
        destination_resolvers.insert(
            "to-arbitrum".to_string(),
            ResolverSpec::Static {
                destinations: vec!["arbitrum".to_string()],
            },
        );

        Arc::new(RelayerConfig {
            chains,
            contracts,
            event_mappings: vec![EventMappingConfig {
                name: "value-set".to_string(),
                source_event: SourceEventConfig {
                    contract: "Store".to_string(),
                    signature: "ValueSet(bytes32 key, bytes value)".to_string(),
                },
                destination_call: DestinationCallConfig {
                    contract: "Store".to_string(),
                    signature: "setValue(bytes proof, bytes32 key, bytes value)".to_string(),
                },
                destination_resolver: "to-arbitrum".to_string(),
                proof_required: true,
                enabled: true,
            }],
            destination_resolvers,
            proof_api: ProofApiConfig {
                base_url: "http://localhost:9/".parse().unwrap(),
                timeout_ms: 1_000,
                retry_attempts: 1,
                api_key: None,
            },
            database: Default::default(),
            logging: Default::default(),
        })
    }

    fn test_listener(
        config: Arc<RelayerConfig>,
        store: Arc<InMemoryStore>,
    ) -> (ChainListener<InMemoryStore, Provider<MockProvider>>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        let resolver = Arc::new(
            DestinationResolver::new(
                config.destination_resolvers.clone(),
                ResolverRegistry::default(),
                &config.event_mappings,
            )
            .unwrap(),
        );
        let listener = ChainListener::new(
            "base".to_string(),
            config,
            Arc::new(provider),
            store,
            resolver,
        )
        .unwrap();
        (listener, mock)
    }

    fn value_set_log(topic0: H256) -> Log {
        let data = ethers::abi::encode(&[
            Token::FixedBytes(vec![0x6b; 32]),
            Token::Bytes(vec![0x12, 0x34]),
        ]);
        Log {
            address: Address::repeat_byte(0x11),
            topics: vec![topic0],
            data: data.into(),
            block_number: Some(U64::from(1000u64)),
            transaction_hash: Some(H256::repeat_byte(0xaa)),
            transaction_index: Some(U64::from(0u64)),
            log_index: Some(2u64.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_sweep_initializes_the_cursor_below_head() {
        let store = Arc::new(InMemoryStore::default());
        let (listener, mock) = test_listener(test_config(2), store.clone());
        mock.push(U64::from(1050u64)).unwrap();
        listener.sweep().await.unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(1048));
        assert!(store.find_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_creates_one_job_per_destination() {
        let store = Arc::new(InMemoryStore::default());
        let config = test_config(2);
        let (listener, mock) = test_listener(config, store.clone());
        store.set_last_processed("base", 999).unwrap();
        let topic0 = listener.targets[0].mapping.topic0;

        // responses pop in reverse push order.
        mock.push::<Vec<Log>, _>(vec![value_set_log(topic0)]).unwrap();
        mock.push(U64::from(1002u64)).unwrap();
        listener.sweep().await.unwrap();

        assert_eq!(store.last_processed("base").unwrap(), Some(1000));
        let jobs = store.find_by_status(JobStatus::Pending).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        let expected_unique_id = format!(
            "base:{:#x}:0:arbitrum",
            H256::repeat_byte(0xaa)
        );
        assert_eq!(job.unique_id, expected_unique_id);
        assert_eq!(job.dest_chain, "arbitrum");
        assert_eq!(job.dest_address, Address::repeat_byte(0x22));
        assert_eq!(job.dest_method, "setValue");
        assert!(job.proof_required);
        assert_eq!(job.event_data.log_index, 0);
        assert_eq!(
            job.event_data.args["value"],
            EventValue::Bytes(vec![0x12, 0x34].into())
        );
    }

    #[tokio::test]
    async fn reobserved_events_do_not_create_duplicate_jobs() {
        let store = Arc::new(InMemoryStore::default());
        let (listener, mock) = test_listener(test_config(2), store.clone());
        store.set_last_processed("base", 999).unwrap();
        let topic0 = listener.targets[0].mapping.topic0;

        mock.push::<Vec<Log>, _>(vec![value_set_log(topic0)]).unwrap();
        mock.push(U64::from(1002u64)).unwrap();
        listener.sweep().await.unwrap();

        // the next range overlaps the same transaction, e.g. after a
        // transient failure between job insert and cursor advance.
        mock.push::<Vec<Log>, _>(vec![value_set_log(topic0)]).unwrap();
        mock.push(U64::from(1003u64)).unwrap();
        listener.sweep().await.unwrap();

        assert_eq!(store.find_by_status(JobStatus::Pending).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_is_capped_at_one_hundred_blocks() {
        let store = Arc::new(InMemoryStore::default());
        let (listener, mock) = test_listener(test_config(0), store.clone());
        store.set_last_processed("base", 100).unwrap();

        mock.push::<Vec<Log>, _>(Vec::<Log>::new()).unwrap();
        mock.push(U64::from(10_000u64)).unwrap();
        listener.sweep().await.unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(200));
    }

    #[tokio::test]
    async fn zero_confirmations_sweeps_to_head_inclusive() {
        let store = Arc::new(InMemoryStore::default());
        let (listener, mock) = test_listener(test_config(0), store.clone());
        store.set_last_processed("base", 100).unwrap();

        mock.push::<Vec<Log>, _>(Vec::<Log>::new()).unwrap();
        mock.push(U64::from(105u64)).unwrap();
        listener.sweep().await.unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(105));
    }

    #[tokio::test]
    async fn no_progress_while_head_is_within_the_confirmation_window() {
        let store = Arc::new(InMemoryStore::default());
        let (listener, mock) = test_listener(test_config(10), store.clone());
        store.set_last_processed("base", 95).unwrap();

        // only the head request is served; a log query would fail loudly.
        mock.push(U64::from(100u64)).unwrap();
        listener.sweep().await.unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(95));
    }
}
