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
//! # Relayer Store Module
//!
//! Durable storage for the relayer: the relay jobs with their state
//! machine, and the per-chain sweep cursor. All job mutation goes through
//! the typed [`JobStore`] operations; no other component writes job rows.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EventData, JobStatus, ProofData};

/// A module for managing in-memory storage of the relayer.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
pub mod sled;

pub use self::sled::SledStore;
pub use mem::InMemoryStore;

/// A relay job: the durable intent to invoke one method on one destination
/// chain in response to one source event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Monotonic id assigned by the store.
    pub id: u64,
    /// `source_chain:tx_hash:event_index:dest_chain`, globally unique.
    pub unique_id: String,
    /// Name of the chain the event was observed on.
    pub source_chain: String,
    /// Hash of the emitting transaction.
    pub source_tx_hash: H256,
    /// Block the event was emitted in.
    pub source_block_number: u64,
    /// Name of the chain the call goes to.
    pub dest_chain: String,
    /// Address of the destination contract.
    pub dest_address: Address,
    /// Name of the invoked method.
    pub dest_method: String,
    /// Canonical method signature, parsed again at execution time.
    pub dest_method_signature: String,
    /// Name of the mapping that produced this job.
    pub mapping_name: String,
    /// Snapshot of the decoded event.
    pub event_data: EventData,
    /// Whether an inclusion proof must be fetched before execution.
    pub proof_required: bool,
    /// The fetched proof, once available.
    pub proof_data: Option<ProofData>,
    /// Position in the job state machine.
    pub status: JobStatus,
    /// Hash of the destination transaction, once submitted.
    pub dest_tx_hash: Option<H256>,
    /// How many times the job re-entered the processing flow.
    pub retry_count: u32,
    /// One-line diagnostic of the last failure.
    pub error_message: Option<String>,
    /// When the job was observed.
    pub created_at: DateTime<Utc>,
    /// Set exactly when the job reaches `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Updated on every status change; drives the retry cooldown.
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// The caller-supplied part of a new job; the store fills in the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// See [`Job::unique_id`].
    pub unique_id: String,
    /// See [`Job::source_chain`].
    pub source_chain: String,
    /// See [`Job::source_tx_hash`].
    pub source_tx_hash: H256,
    /// See [`Job::source_block_number`].
    pub source_block_number: u64,
    /// See [`Job::dest_chain`].
    pub dest_chain: String,
    /// See [`Job::dest_address`].
    pub dest_address: Address,
    /// See [`Job::dest_method`].
    pub dest_method: String,
    /// See [`Job::dest_method_signature`].
    pub dest_method_signature: String,
    /// See [`Job::mapping_name`].
    pub mapping_name: String,
    /// See [`Job::event_data`].
    pub event_data: EventData,
    /// See [`Job::proof_required`].
    pub proof_required: bool,
}

impl Job {
    /// Materialises a fresh job from its spec.
    pub(crate) fn from_spec(id: u64, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            unique_id: spec.unique_id,
            source_chain: spec.source_chain,
            source_tx_hash: spec.source_tx_hash,
            source_block_number: spec.source_block_number,
            dest_chain: spec.dest_chain,
            dest_address: spec.dest_address,
            dest_method: spec.dest_method,
            dest_method_signature: spec.dest_method_signature,
            mapping_name: spec.mapping_name,
            event_data: spec.event_data,
            proof_required: spec.proof_required,
            proof_data: None,
            status: JobStatus::Pending,
            dest_tx_hash: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            completed_at: None,
            last_retry_at: None,
        }
    }
}

/// Optional fields applied together with a status update.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Attach the fetched proof.
    pub proof_data: Option<ProofData>,
    /// Record the destination transaction hash.
    pub dest_tx_hash: Option<H256>,
    /// Record a failure diagnostic.
    pub error_message: Option<String>,
}

impl JobPatch {
    /// Patch attaching a proof.
    pub fn with_proof(mut self, proof: ProofData) -> Self {
        self.proof_data = Some(proof);
        self
    }

    /// Patch recording the destination transaction hash.
    pub fn with_tx_hash(mut self, tx_hash: H256) -> Self {
        self.dest_tx_hash = Some(tx_hash);
        self
    }

    /// Patch recording a failure diagnostic.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// The persisted sweep position of one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainState {
    /// Highest fully processed block.
    pub last_processed_block: u64,
    /// When the cursor last moved.
    pub updated_at: DateTime<Utc>,
}

/// Typed access to the job rows.
///
/// Every operation is atomic; `update_status` additionally enforces the
/// job state machine, so an invalid transition can never be persisted.
pub trait JobStore: Send + Sync {
    /// Inserts a new pending job, failing with
    /// [`Error::DuplicateJob`](crate::Error::DuplicateJob) when the
    /// `unique_id` is already present.
    fn create_job(&self, spec: JobSpec) -> Result<u64>;

    /// Atomically moves a job to `new_status`, applying the patch.
    ///
    /// `completed_at` is set exactly when the target is
    /// [`JobStatus::Completed`]; `last_retry_at` is set on every call.
    fn update_status(&self, id: u64, new_status: JobStatus, patch: JobPatch) -> Result<Job>;

    /// Atomically bumps the retry counter, returning the new value.
    fn increment_retry(&self, id: u64) -> Result<u32>;

    /// Looks a job up by id.
    fn find_by_id(&self, id: u64) -> Result<Option<Job>>;

    /// Looks a job up by its unique id.
    fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Job>>;

    /// All jobs in the given status, ordered by creation time.
    fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Jobs awaiting work (pending, proof_requested or proof_ready),
    /// ordered by creation time.
    fn find_pending(&self) -> Result<Vec<Job>>;

    /// Failed jobs with retry budget left, ordered by last retry time.
    fn find_retryable(&self, max_retries: u32) -> Result<Vec<Job>>;
}

/// Typed access to the per-chain sweep cursor.
pub trait ChainStateStore: Send + Sync {
    /// The last fully processed block, `None` before the first sweep.
    fn last_processed(&self, chain: &str) -> Result<Option<u64>>;

    /// Moves the cursor forward. The cursor is non-decreasing; attempts to
    /// move it backwards are ignored.
    fn set_last_processed(&self, chain: &str, block: u64) -> Result<()>;

    /// The last fully processed block, zero when absent.
    fn last_processed_or_zero(&self, chain: &str) -> Result<u64> {
        Ok(self.last_processed(chain)?.unwrap_or(0))
    }
}

pub(crate) fn sort_by_created(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn sort_by_last_retry(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        let a_key = a.last_retry_at.unwrap_or(a.created_at);
        let b_key = b.last_retry_at.unwrap_or(b.created_at);
        a_key.cmp(&b_key).then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use ethers::types::{Address, H256};

    use super::JobSpec;
    use crate::types::{EventData, EventValue};

    pub(crate) fn test_spec(unique_id: &str) -> JobSpec {
        let mut args = BTreeMap::new();
        args.insert("key".to_string(), EventValue::Uint("1".to_string()));
        JobSpec {
            unique_id: unique_id.to_string(),
            source_chain: "base".to_string(),
            source_tx_hash: H256::repeat_byte(0xaa),
            source_block_number: 1000,
            dest_chain: "arbitrum".to_string(),
            dest_address: Address::repeat_byte(0xbb),
            dest_method: "setValue".to_string(),
            dest_method_signature: "setValue(bytes proof, uint256 key)".to_string(),
            mapping_name: "value-set".to_string(),
            event_data: EventData {
                name: "ValueSet".to_string(),
                args,
                block_number: 1000,
                transaction_index: 0,
                log_index: 2,
            },
            proof_required: true,
        }
    }
}
