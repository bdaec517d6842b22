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
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use super::{sort_by_created, sort_by_last_retry, Job, JobPatch, JobSpec};
use super::{ChainStateStore, JobStore};
use crate::error::{Error, Result};
use crate::types::JobStatus;

#[derive(Default)]
struct Inner {
    jobs: HashMap<u64, Job>,
    unique_index: HashMap<String, u64>,
    next_id: u64,
    chain_state: HashMap<String, u64>,
}

/// InMemoryStore keeps jobs and chain state in process memory.
///
/// It implements the same contracts as [`SledStore`](super::SledStore) and
/// exists for the queue and listener tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl JobStore for InMemoryStore {
    fn create_job(&self, spec: JobSpec) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner.unique_index.contains_key(&spec.unique_id) {
            return Err(Error::DuplicateJob {
                unique_id: spec.unique_id,
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let job = Job::from_spec(id, spec, Utc::now());
        inner.unique_index.insert(job.unique_id.clone(), id);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    fn update_status(&self, id: u64, new_status: JobStatus, patch: JobPatch) -> Result<Job> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(Error::JobNotFound { id })?;
        if !job.status.can_transition_to(new_status) {
            return Err(Error::InvalidStatusTransition {
                from: job.status,
                to: new_status,
            });
        }
        let now = Utc::now();
        job.status = new_status;
        if let Some(proof) = patch.proof_data {
            job.proof_data = Some(proof);
        }
        if let Some(tx_hash) = patch.dest_tx_hash {
            job.dest_tx_hash = Some(tx_hash);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        job.last_retry_at = Some(now);
        if new_status == JobStatus::Completed {
            job.completed_at = Some(now);
        }
        Ok(job.clone())
    }

    fn increment_retry(&self, id: u64) -> Result<u32> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(Error::JobNotFound { id })?;
        job.retry_count += 1;
        job.last_retry_at = Some(Utc::now());
        Ok(job.retry_count)
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Job>> {
        Ok(self.inner.read().jobs.get(&id).cloned())
    }

    fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Job>> {
        let inner = self.inner.read();
        Ok(inner
            .unique_index
            .get(unique_id)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let inner = self.inner.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        sort_by_created(&mut jobs);
        Ok(jobs)
    }

    fn find_pending(&self) -> Result<Vec<Job>> {
        let inner = self.inner.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::ProofRequested | JobStatus::ProofReady
                )
            })
            .cloned()
            .collect();
        sort_by_created(&mut jobs);
        Ok(jobs)
    }

    fn find_retryable(&self, max_retries: u32) -> Result<Vec<Job>> {
        let inner = self.inner.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.retry_count < max_retries)
            .cloned()
            .collect();
        sort_by_last_retry(&mut jobs);
        Ok(jobs)
    }
}

impl ChainStateStore for InMemoryStore {
    fn last_processed(&self, chain: &str) -> Result<Option<u64>> {
        Ok(self.inner.read().chain_state.get(chain).copied())
    }

    fn set_last_processed(&self, chain: &str, block: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.chain_state.entry(chain.to_string()).or_insert(block);
        if *entry < block {
            *entry = block;
        }
        Ok(())
    }
}
