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
//! The job queue drives every relay job through its state machine.
//!
//! A cooperative loop ticks once a second: it refills an in-memory work
//! list from the store when empty, dispatches a bounded batch of jobs to
//! their status-specific handlers, and waits for all of them to settle.
//! Handler failures never escape the queue; they move the job to `failed`
//! with a one-line diagnostic and the standard retry budget applies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::Shutdown;
use crate::error::{Error, Result};
use crate::events_watcher::ChainRpc;
use crate::executor::{CallExecutor, ExecuteParams};
use crate::proof::{ProofBackend, ProofRequest};
use crate::store::{JobPatch, JobStore};
use crate::store::Job;
use crate::types::JobStatus;

/// How often the scheduling loop ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// How many handlers run concurrently per tick.
const CONCURRENCY: usize = 5;
/// How many times a failed job re-enters the processing flow.
pub const MAX_RETRIES: u32 = 3;
/// How long a failed job cools down before re-entering.
const RETRY_COOLDOWN: Duration = Duration::from_secs(5);
/// How long in-flight handlers get to settle on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunable queue parameters; the defaults are the production values.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often the scheduling loop ticks.
    pub tick_interval: Duration,
    /// How many handlers run concurrently per tick.
    pub concurrency: usize,
    /// How many times a failed job re-enters the processing flow.
    pub max_retries: u32,
    /// How long a failed job cools down before re-entering.
    pub retry_cooldown: Duration,
    /// How long in-flight handlers get to settle on shutdown.
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            concurrency: CONCURRENCY,
            max_retries: MAX_RETRIES,
            retry_cooldown: RETRY_COOLDOWN,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

/// The scheduler. Owns no long-term data; reads jobs from the store,
/// dispatches work, writes the outcomes back.
pub struct JobQueue<S> {
    store: Arc<S>,
    proof: Arc<dyn ProofBackend>,
    executors: HashMap<String, Arc<dyn CallExecutor>>,
    chain_rpcs: HashMap<String, Arc<dyn ChainRpc>>,
    chain_ids: HashMap<String, u64>,
    config: QueueConfig,
}

impl<S: JobStore + 'static> JobQueue<S> {
    /// Builds the queue.
    ///
    /// `executors` is keyed by destination chain name, `chain_rpcs` and
    /// `chain_ids` by source chain name.
    pub fn new(
        store: Arc<S>,
        proof: Arc<dyn ProofBackend>,
        executors: HashMap<String, Arc<dyn CallExecutor>>,
        chain_rpcs: HashMap<String, Arc<dyn ChainRpc>>,
        chain_ids: HashMap<String, u64>,
    ) -> Self {
        Self {
            store,
            proof,
            executors,
            chain_rpcs,
            chain_ids,
            config: QueueConfig::default(),
        }
    }

    /// Overrides the queue parameters.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the scheduling loop until shutdown.
    ///
    /// On shutdown the queue stops pulling new jobs, gives the in-flight
    /// tick up to the drain deadline to settle, then abandons it; jobs
    /// left in intermediate statuses are recovered on the next start.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        self.recover_interrupted()?;
        let mut work: VecDeque<Job> = VecDeque::new();
        tracing::info!("job queue started");
        loop {
            {
                let tick = self.tick(&mut work);
                tokio::pin!(tick);
                tokio::select! {
                    _ = &mut tick => {}
                    _ = shutdown.recv() => {
                        tracing::info!("draining in-flight job handlers");
                        if tokio::time::timeout(self.config.drain_timeout, &mut tick)
                            .await
                            .is_err()
                        {
                            tracing::warn!("drain deadline exceeded, abandoning in-flight handlers");
                        }
                        return Ok(());
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Fails jobs stranded in `executing` by an abrupt shutdown so the
    /// standard retry path re-enters them.
    fn recover_interrupted(&self) -> Result<()> {
        for job in self.store.find_by_status(JobStatus::Executing)? {
            tracing::warn!(job = job.id, "recovering job interrupted mid-execution");
            self.store.update_status(
                job.id,
                JobStatus::Failed,
                JobPatch::default().with_error("execution interrupted by shutdown"),
            )?;
        }
        Ok(())
    }

    /// One scheduling tick.
    async fn tick(&self, work: &mut VecDeque<Job>) {
        if work.is_empty() {
            match self.store.find_retryable(self.config.max_retries) {
                Ok(jobs) => work.extend(jobs),
                Err(e) => tracing::error!("failed to pull retryable jobs: {e}"),
            }
            match self.store.find_pending() {
                Ok(jobs) => work.extend(jobs),
                Err(e) => tracing::error!("failed to pull pending jobs: {e}"),
            }
        }
        let batch: Vec<Job> = (0..self.config.concurrency)
            .filter_map(|_| work.pop_front())
            .collect();
        if batch.is_empty() {
            return;
        }
        tracing::trace!(batch = batch.len(), backlog = work.len(), "dispatching jobs");
        let handlers = batch.into_iter().map(|job| self.process(job));
        for requeued in futures::future::join_all(handlers).await.into_iter().flatten() {
            work.push_back(requeued);
        }
    }

    /// Dispatches one job to its status-specific handler, converting any
    /// failure into a `failed` transition. Returns the job when it should
    /// be re-queued unchanged.
    async fn process(&self, job: Job) -> Option<Job> {
        let id = job.id;
        let status = job.status;
        let outcome = match status {
            JobStatus::Pending if job.proof_required => self.handle_proof(&job).await,
            JobStatus::ProofRequested => self.handle_proof(&job).await,
            JobStatus::Pending | JobStatus::ProofReady => self.handle_execute(&job).await,
            JobStatus::Failed => return self.handle_retry(job),
            JobStatus::Executing | JobStatus::Completed => {
                tracing::trace!(job = id, %status, "nothing to do");
                return None;
            }
        };
        if let Err(e) = outcome {
            let message = e.one_line();
            tracing::warn!(job = id, error = %message, "job handler failed");
            let patch = JobPatch::default().with_error(message);
            if let Err(update_err) = self.store.update_status(id, JobStatus::Failed, patch) {
                tracing::error!(job = id, "failed to record job failure: {update_err}");
            }
        }
        None
    }

    /// Requests the inclusion proof and attaches it to the job.
    async fn handle_proof(&self, job: &Job) -> Result<()> {
        if job.status == JobStatus::Pending {
            self.store
                .update_status(job.id, JobStatus::ProofRequested, JobPatch::default())?;
        }
        let src_chain_id =
            *self
                .chain_ids
                .get(&job.source_chain)
                .ok_or_else(|| Error::ChainNotFound {
                    chain: job.source_chain.clone(),
                })?;
        let global_log_index = self.global_log_index(job).await;
        let proof = self
            .proof
            .request_proof(ProofRequest {
                src_chain_id,
                src_block_number: job.source_block_number,
                global_log_index,
            })
            .await?;
        self.store.update_status(
            job.id,
            JobStatus::ProofReady,
            JobPatch::default().with_proof(proof),
        )?;
        tracing::debug!(job = job.id, "proof attached");
        Ok(())
    }

    /// Translates the stored filter-local log position into the receipt's
    /// absolute log index.
    ///
    /// Falls back to the stored index when the receipt cannot be fetched.
    /// That fallback is unsound against the proof service and warns
    /// loudly.
    async fn global_log_index(&self, job: &Job) -> u64 {
        let local = job.event_data.log_index;
        let Some(rpc) = self.chain_rpcs.get(&job.source_chain) else {
            tracing::warn!(
                job = job.id,
                chain = %job.source_chain,
                "no rpc for the source chain; using the filter-local log index, \
                 the requested proof may not match the event",
            );
            return local;
        };
        match rpc.get_transaction_receipt(job.source_tx_hash).await {
            Ok(Some(receipt)) => {
                if let Some(index) = receipt
                    .logs
                    .get(local as usize)
                    .and_then(|log| log.log_index)
                {
                    return index.as_u64();
                }
                tracing::warn!(
                    job = job.id,
                    position = local,
                    "receipt carries no log at the stored position; using the \
                     filter-local log index, the requested proof may not match the event",
                );
                local
            }
            Ok(None) => {
                tracing::warn!(
                    job = job.id,
                    tx = ?job.source_tx_hash,
                    "transaction receipt not found; using the filter-local log \
                     index, the requested proof may not match the event",
                );
                local
            }
            Err(e) => {
                tracing::warn!(
                    job = job.id,
                    tx = ?job.source_tx_hash,
                    "failed to fetch the transaction receipt ({e}); using the \
                     filter-local log index, the requested proof may not match the event",
                );
                local
            }
        }
    }

    /// Submits the destination call and completes the job.
    async fn handle_execute(&self, job: &Job) -> Result<()> {
        if job.proof_required && job.proof_data.is_none() {
            return Err(Error::Generic("job requires a proof but carries none"));
        }
        self.store
            .update_status(job.id, JobStatus::Executing, JobPatch::default())?;
        let executor =
            self.executors
                .get(&job.dest_chain)
                .ok_or_else(|| Error::ChainNotFound {
                    chain: job.dest_chain.clone(),
                })?;
        let tx_hash = executor
            .execute(ExecuteParams {
                contract_address: job.dest_address,
                method_name: job.dest_method.clone(),
                method_signature: job.dest_method_signature.clone(),
                event_data: job.event_data.clone(),
                proof_data: job.proof_data.clone(),
            })
            .await?;
        self.store.update_status(
            job.id,
            JobStatus::Completed,
            JobPatch::default().with_tx_hash(tx_hash),
        )?;
        tracing::info!(job = job.id, tx = ?tx_hash, "job completed");
        Ok(())
    }

    /// Re-enters a failed job once its cooldown has passed and budget
    /// remains. Returns the job when it was re-queued unchanged.
    fn handle_retry(&self, job: Job) -> Option<Job> {
        if job.retry_count >= self.config.max_retries {
            tracing::trace!(job = job.id, "retry budget exhausted, leaving job failed");
            return None;
        }
        let reference = job.last_retry_at.unwrap_or(job.created_at);
        let cooldown = chrono::Duration::from_std(self.config.retry_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        if Utc::now().signed_duration_since(reference) < cooldown {
            // too early; keep the job in the work list untouched.
            return Some(job);
        }
        let reenter = || -> Result<()> {
            let retry_count = self.store.increment_retry(job.id)?;
            let next = if job.proof_required && job.proof_data.is_none() {
                JobStatus::Pending
            } else if job.proof_required {
                JobStatus::ProofReady
            } else {
                JobStatus::Pending
            };
            self.store
                .update_status(job.id, next, JobPatch::default())?;
            tracing::debug!(job = job.id, retry_count, next = %next, "job re-entered");
            Ok(())
        };
        if let Err(e) = reenter() {
            tracing::error!(job = job.id, "failed to re-enter job: {e}");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::test_spec;
    use crate::store::InMemoryStore;
    use crate::types::ProofData;
    use ethers::types::{TransactionReceipt, H256, U256};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProof {
        failures_remaining: AtomicU32,
        requests: Mutex<Vec<ProofRequest>>,
    }

    impl StubProof {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_remaining: AtomicU32::new(failures),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ProofBackend for StubProof {
        async fn request_proof(&self, request: ProofRequest) -> Result<ProofData> {
            self.requests.lock().push(request);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ProofPollingTimeout { attempts: 30 });
            }
            Ok(ProofData {
                proof: vec![0xde, 0xad],
            })
        }
    }

    struct StubExecutor {
        fail_always: bool,
        calls: AtomicU32,
    }

    impl StubExecutor {
        fn new(fail_always: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_always,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl CallExecutor for StubExecutor {
        async fn execute(&self, _params: ExecuteParams) -> Result<H256> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_always {
                return Err(Error::ExecutionReverted {
                    tx_hash: H256::repeat_byte(0xee),
                });
            }
            Ok(H256::repeat_byte(0xbb))
        }
    }

    struct StubRpc;

    #[async_trait::async_trait]
    impl ChainRpc for StubRpc {
        async fn get_transaction_receipt(
            &self,
            _tx_hash: H256,
        ) -> Result<Option<TransactionReceipt>> {
            // the job stores filter-local position 2; the receipt's log at
            // that position carries the absolute index 5.
            let mut logs = Vec::new();
            for index in [3u64, 4, 5] {
                logs.push(ethers::types::Log {
                    log_index: Some(U256::from(index)),
                    ..Default::default()
                });
            }
            Ok(Some(TransactionReceipt {
                logs,
                ..Default::default()
            }))
        }
    }

    fn test_queue(
        store: Arc<InMemoryStore>,
        proof: Arc<StubProof>,
        executor: Arc<StubExecutor>,
    ) -> JobQueue<InMemoryStore> {
        let mut executors: HashMap<String, Arc<dyn CallExecutor>> = HashMap::new();
        executors.insert("arbitrum".to_string(), executor);
        let mut chain_rpcs: HashMap<String, Arc<dyn ChainRpc>> = HashMap::new();
        chain_rpcs.insert("base".to_string(), Arc::new(StubRpc));
        let mut chain_ids = HashMap::new();
        chain_ids.insert("base".to_string(), 84532u64);
        JobQueue::new(store, proof, executors, chain_rpcs, chain_ids).with_config(QueueConfig {
            retry_cooldown: Duration::from_secs(0),
            ..Default::default()
        })
    }

    async fn run_ticks(queue: &JobQueue<InMemoryStore>, ticks: usize) {
        let mut work = VecDeque::new();
        for _ in 0..ticks {
            queue.tick(&mut work).await;
        }
    }

    #[tokio::test]
    async fn proof_carrying_job_walks_the_happy_path() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(0);
        let executor = StubExecutor::new(false);
        let queue = test_queue(store.clone(), proof.clone(), executor.clone());
        let id = store.create_job(test_spec("base:0xaa:2:arbitrum")).unwrap();

        run_ticks(&queue, 1).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::ProofReady);
        assert_eq!(job.proof_data.as_ref().unwrap().proof, vec![0xde, 0xad]);

        run_ticks(&queue, 1).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.dest_tx_hash, Some(H256::repeat_byte(0xbb)));
        assert!(job.completed_at.is_some());
        assert_eq!(job.retry_count, 0);

        // the stored filter-local position 2 was translated through the
        // receipt into the absolute index 5.
        let requests = proof.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].global_log_index, 5);
        assert_eq!(requests[0].src_chain_id, 84532);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn proofless_job_executes_directly() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(0);
        let executor = StubExecutor::new(false);
        let queue = test_queue(store.clone(), proof.clone(), executor.clone());
        let mut spec = test_spec("base:0xaa:0:arbitrum");
        spec.proof_required = false;
        let id = store.create_job(spec).unwrap();

        run_ticks(&queue, 1).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(proof.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn proof_timeout_retries_and_then_completes() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(1);
        let executor = StubExecutor::new(false);
        let queue = test_queue(store.clone(), proof.clone(), executor.clone());
        let id = store.create_job(test_spec("base:0xaa:2:arbitrum")).unwrap();

        run_ticks(&queue, 1).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .contains("polling timed out"));

        // retry re-enters at pending (no proof yet), then the proof
        // succeeds and the job completes.
        run_ticks(&queue, 3).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn permanently_failing_job_is_abandoned_after_max_retries() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(0);
        let executor = StubExecutor::new(true);
        let queue = test_queue(store.clone(), proof, executor.clone());
        let mut spec = test_spec("base:0xaa:0:arbitrum");
        spec.proof_required = false;
        let id = store.create_job(spec).unwrap();

        run_ticks(&queue, 12).await;
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, MAX_RETRIES);
        // the initial attempt plus three retries.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
        assert!(store.find_retryable(MAX_RETRIES).unwrap().is_empty());
    }

    #[tokio::test]
    async fn cooling_down_jobs_are_requeued_unchanged() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(0);
        let executor = StubExecutor::new(false);
        let queue = test_queue(store.clone(), proof, executor)
            .with_config(QueueConfig::default()); // production 5 s cooldown
        let mut spec = test_spec("base:0xaa:0:arbitrum");
        spec.proof_required = false;
        let id = store.create_job(spec).unwrap();
        store
            .update_status(id, JobStatus::Executing, JobPatch::default())
            .unwrap();
        store
            .update_status(
                id,
                JobStatus::Failed,
                JobPatch::default().with_error("reverted"),
            )
            .unwrap();

        let mut work = VecDeque::new();
        queue.tick(&mut work).await;
        // the cooldown has not passed; the job stays queued, untouched.
        assert_eq!(work.len(), 1);
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn startup_recovers_jobs_stranded_in_executing() {
        let store = Arc::new(InMemoryStore::default());
        let proof = StubProof::new(0);
        let executor = StubExecutor::new(false);
        let queue = test_queue(store.clone(), proof, executor);
        let mut spec = test_spec("base:0xaa:0:arbitrum");
        spec.proof_required = false;
        let id = store.create_job(spec).unwrap();
        store
            .update_status(id, JobStatus::Executing, JobPatch::default())
            .unwrap();

        queue.recover_interrupted().unwrap();
        let job = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("execution interrupted by shutdown")
        );
    }
}
