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
//! Destination call execution.
//!
//! One executor runs per destination chain and owns that chain's signing
//! key. It encodes the configured method call from the job's event
//! snapshot and proof, estimates gas, applies the chain's gas multiplier
//! and optional EIP-1559 fee overrides, submits, and waits for the
//! configured number of confirmations.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, TransactionRequest, H256, U256};

use crate::codec::{self, MethodSignature};
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::types::{EventData, ProofData};

/// Everything the executor needs to submit one destination call.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// The destination contract.
    pub contract_address: Address,
    /// Name of the invoked method.
    pub method_name: String,
    /// The method schema, parsed at execution time.
    pub method_signature: String,
    /// Snapshot of the source event.
    pub event_data: EventData,
    /// The inclusion proof, when the mapping requires one.
    pub proof_data: Option<ProofData>,
}

/// Submits destination calls for one chain.
///
/// The queue holds executors as trait objects so tests can substitute
/// stubs.
#[async_trait::async_trait]
pub trait CallExecutor: Send + Sync {
    /// Encodes, submits and confirms the call, returning the transaction
    /// hash.
    async fn execute(&self, params: ExecuteParams) -> Result<H256>;
}

/// [`CallExecutor`] backed by an ethers signing client.
pub struct EvmExecutor<M> {
    chain_name: String,
    client: Arc<M>,
    gas_multiplier: f64,
    confirmations: usize,
    max_fee_per_gas: Option<u64>,
    max_priority_fee_per_gas: Option<u64>,
}

impl<M> EvmExecutor<M> {
    /// Builds the executor from the chain configuration. The client must
    /// already carry the chain's signer.
    pub fn new(chain_name: String, client: Arc<M>, chain: &ChainConfig) -> Self {
        Self {
            chain_name,
            client,
            gas_multiplier: chain.gas_multiplier,
            // a submitted call always waits for at least one confirmation.
            confirmations: cmp::max(chain.confirmations, 1) as usize,
            max_fee_per_gas: chain.max_fee_per_gas,
            max_priority_fee_per_gas: chain.max_priority_fee_per_gas,
        }
    }
}

/// Scales a gas estimate by the configured multiplier, flooring the result.
pub(crate) fn scale_gas(gas: U256, multiplier: f64) -> U256 {
    let capped = gas.min(U256::from(u128::MAX)).as_u128();
    let scaled = (capped as f64 * multiplier).floor();
    U256::from(scaled as u128)
}

#[async_trait::async_trait]
impl<M: Middleware + 'static> CallExecutor for EvmExecutor<M> {
    #[tracing::instrument(
        skip_all,
        fields(chain = %self.chain_name, method = %params.method_name),
    )]
    async fn execute(&self, params: ExecuteParams) -> Result<H256> {
        let method = MethodSignature::parse(&params.method_signature)?;
        let calldata: ethers::types::Bytes =
            codec::build_call_data(&method, &params.event_data, params.proof_data.as_ref())?
                .into();

        let mut tx: TypedTransaction = match (self.max_fee_per_gas, self.max_priority_fee_per_gas)
        {
            (Some(max_fee), Some(max_priority)) => Eip1559TransactionRequest::new()
                .to(params.contract_address)
                .data(calldata)
                .max_fee_per_gas(max_fee)
                .max_priority_fee_per_gas(max_priority)
                .into(),
            _ => TransactionRequest::new()
                .to(params.contract_address)
                .data(calldata)
                .into(),
        };

        let estimate = self
            .client
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;
        let gas_limit = scale_gas(estimate, self.gas_multiplier);
        tx.set_gas(gas_limit);
        tracing::trace!(%estimate, %gas_limit, "gas estimated");

        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;
        let submitted_hash = *pending;
        tracing::debug!(tx = ?submitted_hash, "transaction submitted, awaiting confirmations");

        let receipt = pending
            .confirmations(self.confirmations)
            .interval(Duration::from_millis(1000))
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?
            .ok_or_else(|| {
                Error::Rpc(format!(
                    "transaction {submitted_hash:#x} dropped from the mempool"
                ))
            })?;
        match receipt.status {
            Some(status) if status.is_zero() => Err(Error::ExecutionReverted {
                tx_hash: receipt.transaction_hash,
            }),
            _ => {
                tracing::info!(
                    tx = ?receipt.transaction_hash,
                    block = ?receipt.block_number,
                    "destination call confirmed",
                );
                Ok(receipt.transaction_hash)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_scaling_floors() {
        assert_eq!(scale_gas(U256::from(100u64), 1.0), U256::from(100u64));
        assert_eq!(scale_gas(U256::from(100u64), 1.2), U256::from(120u64));
        assert_eq!(scale_gas(U256::from(3u64), 1.5), U256::from(4u64));
        assert_eq!(scale_gas(U256::from(100u64), 1.257), U256::from(125u64));
    }
}
