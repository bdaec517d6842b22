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
//! Service wiring: builds the resolver, the proof client, one listener
//! per source chain and one executor per destination chain, then starts
//! the long-running tasks under the shared shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::middleware::SignerMiddleware;

use crate::context::RelayerContext;
use crate::error::Result;
use crate::events_watcher::{ChainListener, ChainRpc, ProviderChainRpc};
use crate::executor::{CallExecutor, EvmExecutor};
use crate::proof::{PolymerProofClient, ProofBackend};
use crate::queue::JobQueue;
use crate::resolver::DestinationResolver;
use crate::store::SledStore;

/// Wires the components and spawns the background tasks.
///
/// Fails fast on configuration problems (unknown resolvers, missing
/// signing keys for destination chains); runtime errors after this point
/// are handled inside the tasks.
pub async fn start_background_services(
    ctx: &RelayerContext,
    store: Arc<SledStore>,
) -> Result<()> {
    let config = ctx.config.clone();
    let resolver = Arc::new(DestinationResolver::new(
        config.destination_resolvers.clone(),
        ctx.resolver_registry().clone(),
        &config.event_mappings,
    )?);
    let proof: Arc<dyn ProofBackend> = Arc::new(PolymerProofClient::new(&config.proof_api)?);

    let mut executors: HashMap<String, Arc<dyn CallExecutor>> = HashMap::new();
    let mut chain_rpcs: HashMap<String, Arc<dyn ChainRpc>> = HashMap::new();
    let mut chain_ids: HashMap<String, u64> = HashMap::new();

    for (chain_name, chain) in &config.chains {
        chain_ids.insert(chain_name.clone(), chain.chain_id);
        let client = Arc::new(ctx.evm_provider(chain_name)?);
        chain_rpcs.insert(
            chain_name.clone(),
            Arc::new(ProviderChainRpc::new(client.clone())),
        );

        let listener = ChainListener::new(
            chain_name.clone(),
            config.clone(),
            client.clone(),
            store.clone(),
            resolver.clone(),
        )?;
        if listener.has_targets() {
            tracing::debug!(chain = %chain_name, "event listener started");
            let mut shutdown_signal = ctx.shutdown_signal();
            tokio::task::spawn(async move {
                tokio::select! {
                    result = listener.run() => {
                        if let Err(e) = result {
                            tracing::error!("event listener stopped: {e}");
                        }
                    }
                    _ = shutdown_signal.recv() => {}
                }
            });
        }

        let is_destination = config.contracts.values().any(|deployments| {
            deployments
                .get(chain_name)
                .map(|dep| dep.role.is_destination())
                .unwrap_or(false)
        });
        if is_destination {
            let wallet = ctx.evm_wallet(chain_name)?;
            let signer = Arc::new(SignerMiddleware::new(ctx.evm_provider(chain_name)?, wallet));
            executors.insert(
                chain_name.clone(),
                Arc::new(EvmExecutor::new(chain_name.clone(), signer, chain)),
            );
            tracing::debug!(chain = %chain_name, "executor ready");
        }
    }

    let queue = JobQueue::new(store, proof, executors, chain_rpcs, chain_ids);
    let shutdown_signal = ctx.shutdown_signal();
    tokio::task::spawn(async move {
        if let Err(e) = queue.run(shutdown_signal).await {
            tracing::error!("job queue stopped: {e}");
        }
    });
    Ok(())
}
