use std::path::Path;

use chrono::Utc;
use sled::transaction::ConflictableTransactionError;

use super::{sort_by_created, sort_by_last_retry, ChainState, Job, JobPatch, JobSpec};
use super::{ChainStateStore, JobStore};
use crate::error::{Error, Result};
use crate::types::JobStatus;

const JOBS_TREE: &str = "jobs";
const CHAIN_STATE_TREE: &str = "chain_state";

const META_NEXT_ID: &[u8] = b"meta:next_id";

fn job_key(id: u64) -> Vec<u8> {
    let mut key = b"job:".to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn uid_key(unique_id: &str) -> Vec<u8> {
    let mut key = b"uid:".to_vec();
    key.extend_from_slice(unique_id.as_bytes());
    key
}

fn status_key(status: JobStatus, id: u64) -> Vec<u8> {
    let mut key = status_prefix(status);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn status_prefix(status: JobStatus) -> Vec<u8> {
    vec![b's', b'i', b'x', b':', status.as_byte(), b':']
}

fn commit<T>(result: sled::transaction::TransactionResult<T, Error>) -> Result<T> {
    result.map_err(|e| match e {
        sled::transaction::TransactionError::Abort(e) => e,
        sled::transaction::TransactionError::Storage(e) => Error::Sled(e),
    })
}

fn abort<T>(error: Error) -> std::result::Result<T, ConflictableTransactionError<Error>> {
    Err(ConflictableTransactionError::Abort(error))
}

/// A [Sled](https://sled.rs)-based durable store for jobs and chain state.
///
/// Job rows live in a single tree under namespaced keys
/// (`job:<id>`, `uid:<unique_id>`, `six:<status>:<id>`) so every mutation
/// is a single-tree transaction. Writes are flushed by sled before the
/// calling operation returns from the transaction.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .use_compression(true)
            .compression_factor(18)
            .open()?;
        Ok(Self { db })
    }

    /// Opens a temporary database that is deleted on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn jobs_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(JOBS_TREE)?)
    }

    fn load_job(tree: &sled::Tree, id: u64) -> Result<Option<Job>> {
        match tree.get(job_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let tree = self.jobs_tree()?;
        let mut jobs = Vec::new();
        for entry in tree.scan_prefix(status_prefix(status)) {
            let (key, _) = entry?;
            let id_bytes: [u8; 8] = key[key.len() - 8..]
                .try_into()
                .map_err(|_| Error::Generic("malformed status index key"))?;
            if let Some(job) = Self::load_job(&tree, u64::from_be_bytes(id_bytes))? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

impl JobStore for SledStore {
    #[tracing::instrument(skip(self, spec), fields(unique_id = %spec.unique_id))]
    fn create_job(&self, spec: JobSpec) -> Result<u64> {
        let tree = self.jobs_tree()?;
        let now = Utc::now();
        let result = tree.transaction(|tx| {
            if tx.get(uid_key(&spec.unique_id))?.is_some() {
                return abort(Error::DuplicateJob {
                    unique_id: spec.unique_id.clone(),
                });
            }
            let id = match tx.get(META_NEXT_ID)? {
                Some(bytes) => {
                    let raw: [u8; 8] = bytes
                        .as_ref()
                        .try_into()
                        .map_err(|_| {
                            ConflictableTransactionError::Abort(Error::Generic(
                                "corrupt job id counter",
                            ))
                        })?;
                    u64::from_be_bytes(raw)
                }
                None => 1,
            };
            let job = Job::from_spec(id, spec.clone(), now);
            let bytes = match serde_json::to_vec(&job) {
                Ok(bytes) => bytes,
                Err(e) => return abort(Error::Json(e)),
            };
            tx.insert(job_key(id), bytes)?;
            tx.insert(uid_key(&job.unique_id), &id.to_be_bytes()[..])?;
            tx.insert(status_key(JobStatus::Pending, id), &b""[..])?;
            tx.insert(META_NEXT_ID, &(id + 1).to_be_bytes()[..])?;
            Ok(id)
        });
        commit(result)
    }

    #[tracing::instrument(skip(self, patch), fields(job = id, status = %new_status))]
    fn update_status(&self, id: u64, new_status: JobStatus, patch: JobPatch) -> Result<Job> {
        let tree = self.jobs_tree()?;
        let now = Utc::now();
        let result = tree.transaction(|tx| {
            let bytes = match tx.get(job_key(id))? {
                Some(bytes) => bytes,
                None => return abort(Error::JobNotFound { id }),
            };
            let mut job: Job = match serde_json::from_slice(&bytes) {
                Ok(job) => job,
                Err(e) => return abort(Error::Json(e)),
            };
            if !job.status.can_transition_to(new_status) {
                return abort(Error::InvalidStatusTransition {
                    from: job.status,
                    to: new_status,
                });
            }
            let old_status = job.status;
            job.status = new_status;
            if let Some(proof) = patch.proof_data.clone() {
                job.proof_data = Some(proof);
            }
            if let Some(tx_hash) = patch.dest_tx_hash {
                job.dest_tx_hash = Some(tx_hash);
            }
            if let Some(message) = patch.error_message.clone() {
                job.error_message = Some(message);
            }
            job.last_retry_at = Some(now);
            if new_status == JobStatus::Completed {
                job.completed_at = Some(now);
            }
            let bytes = match serde_json::to_vec(&job) {
                Ok(bytes) => bytes,
                Err(e) => return abort(Error::Json(e)),
            };
            tx.insert(job_key(id), bytes)?;
            tx.remove(status_key(old_status, id))?;
            tx.insert(status_key(new_status, id), &b""[..])?;
            Ok(job)
        });
        commit(result)
    }

    #[tracing::instrument(skip(self), fields(job = id))]
    fn increment_retry(&self, id: u64) -> Result<u32> {
        let tree = self.jobs_tree()?;
        let now = Utc::now();
        let result = tree.transaction(|tx| {
            let bytes = match tx.get(job_key(id))? {
                Some(bytes) => bytes,
                None => return abort(Error::JobNotFound { id }),
            };
            let mut job: Job = match serde_json::from_slice(&bytes) {
                Ok(job) => job,
                Err(e) => return abort(Error::Json(e)),
            };
            job.retry_count += 1;
            job.last_retry_at = Some(now);
            let bytes = match serde_json::to_vec(&job) {
                Ok(bytes) => bytes,
                Err(e) => return abort(Error::Json(e)),
            };
            tx.insert(job_key(id), bytes)?;
            Ok(job.retry_count)
        });
        commit(result)
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Job>> {
        let tree = self.jobs_tree()?;
        Self::load_job(&tree, id)
    }

    fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Job>> {
        let tree = self.jobs_tree()?;
        match tree.get(uid_key(unique_id))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Generic("malformed unique id index value"))?;
                Self::load_job(&tree, u64::from_be_bytes(raw))
            }
            None => Ok(None),
        }
    }

    fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_with_status(status)?;
        sort_by_created(&mut jobs);
        Ok(jobs)
    }

    fn find_pending(&self) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_with_status(JobStatus::Pending)?;
        jobs.extend(self.jobs_with_status(JobStatus::ProofRequested)?);
        jobs.extend(self.jobs_with_status(JobStatus::ProofReady)?);
        sort_by_created(&mut jobs);
        Ok(jobs)
    }

    fn find_retryable(&self, max_retries: u32) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_with_status(JobStatus::Failed)?;
        jobs.retain(|job| job.retry_count < max_retries);
        sort_by_last_retry(&mut jobs);
        Ok(jobs)
    }
}

impl ChainStateStore for SledStore {
    fn last_processed(&self, chain: &str) -> Result<Option<u64>> {
        let tree = self.db.open_tree(CHAIN_STATE_TREE)?;
        match tree.get(chain.as_bytes())? {
            Some(bytes) => {
                let state: ChainState = serde_json::from_slice(&bytes)?;
                Ok(Some(state.last_processed_block))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    fn set_last_processed(&self, chain: &str, block: u64) -> Result<()> {
        let tree = self.db.open_tree(CHAIN_STATE_TREE)?;
        if let Some(current) = self.last_processed(chain)? {
            if current > block {
                tracing::trace!(current, block, "ignoring backwards cursor move");
                return Ok(());
            }
        }
        let state = ChainState {
            last_processed_block: block,
            updated_at: Utc::now(),
        };
        tree.insert(chain.as_bytes(), serde_json::to_vec(&state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_spec;
    use super::*;
    use crate::types::ProofData;
    use ethers::types::H256;

    fn temp_store() -> SledStore {
        SledStore::temporary().unwrap()
    }

    #[test]
    fn duplicate_unique_id_is_rejected() {
        let store = temp_store();
        let id = store.create_job(test_spec("base:0xaa:2:arbitrum")).unwrap();
        assert_eq!(id, 1);
        let err = store
            .create_job(test_spec("base:0xaa:2:arbitrum"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateJob { .. }));
        assert_eq!(store.create_job(test_spec("base:0xaa:3:arbitrum")).unwrap(), 2);
        let job = store
            .find_by_unique_id("base:0xaa:2:arbitrum")
            .unwrap()
            .unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn status_updates_follow_the_state_machine() {
        let store = temp_store();
        let id = store.create_job(test_spec("a:0x1:0:b")).unwrap();

        // the proof-carrying path, end to end.
        store
            .update_status(id, JobStatus::ProofRequested, JobPatch::default())
            .unwrap();
        let job = store
            .update_status(
                id,
                JobStatus::ProofReady,
                JobPatch::default().with_proof(ProofData {
                    proof: vec![0xde, 0xad],
                }),
            )
            .unwrap();
        assert_eq!(job.proof_data.unwrap().proof, vec![0xde, 0xad]);
        store
            .update_status(id, JobStatus::Executing, JobPatch::default())
            .unwrap();
        let job = store
            .update_status(
                id,
                JobStatus::Completed,
                JobPatch::default().with_tx_hash(H256::repeat_byte(0xcc)),
            )
            .unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.dest_tx_hash, Some(H256::repeat_byte(0xcc)));

        // completed is terminal.
        let err = store
            .update_status(id, JobStatus::Failed, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let store = temp_store();
        let id = store.create_job(test_spec("a:0x1:0:b")).unwrap();
        let err = store
            .update_status(id, JobStatus::Completed, JobPatch::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStatusTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
            }
        ));
        // completed_at only ever comes from a completed transition.
        assert!(store.find_by_id(id).unwrap().unwrap().completed_at.is_none());
    }

    #[test]
    fn find_pending_spans_the_waiting_statuses_in_creation_order() {
        let store = temp_store();
        let first = store.create_job(test_spec("a:0x1:0:b")).unwrap();
        let second = store.create_job(test_spec("a:0x1:1:b")).unwrap();
        let third = store.create_job(test_spec("a:0x1:2:b")).unwrap();
        store
            .update_status(second, JobStatus::ProofRequested, JobPatch::default())
            .unwrap();
        store
            .update_status(third, JobStatus::Executing, JobPatch::default())
            .unwrap();

        let pending = store.find_pending().unwrap();
        let ids: Vec<u64> = pending.iter().map(|j| j.id).collect();
        // executing jobs are in flight and not selectable.
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn find_retryable_respects_the_budget() {
        let store = temp_store();
        let exhausted = store.create_job(test_spec("a:0x1:0:b")).unwrap();
        let retryable = store.create_job(test_spec("a:0x1:1:b")).unwrap();
        for id in [exhausted, retryable] {
            store
                .update_status(id, JobStatus::ProofRequested, JobPatch::default())
                .unwrap();
            store
                .update_status(
                    id,
                    JobStatus::Failed,
                    JobPatch::default().with_error("proof polling timed out"),
                )
                .unwrap();
        }
        for _ in 0..3 {
            store.increment_retry(exhausted).unwrap();
        }
        assert_eq!(store.increment_retry(retryable).unwrap(), 1);

        let retryable_jobs = store.find_retryable(3).unwrap();
        let ids: Vec<u64> = retryable_jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![retryable]);
        let job = &retryable_jobs[0];
        assert_eq!(job.error_message.as_deref(), Some("proof polling timed out"));
    }

    #[test]
    fn chain_cursor_is_monotonic() {
        let store = temp_store();
        assert_eq!(store.last_processed("base").unwrap(), None);
        assert_eq!(store.last_processed_or_zero("base").unwrap(), 0);

        store.set_last_processed("base", 10).unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(10));
        store.set_last_processed("base", 5).unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(10));
        store.set_last_processed("base", 20).unwrap();
        assert_eq!(store.last_processed("base").unwrap(), Some(20));
    }
}
