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
//! Client for the external proof service.
//!
//! Proof retrieval is a two-phase protocol over JSON-RPC 2.0:
//! `polymer_requestProof` registers the proof job and returns a numeric job
//! id, then `polymer_queryProof` is polled until the proof is `complete`.
//! The request phase retries with exponential backoff; the poll phase is
//! bounded by a fixed attempt budget.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ProofApiConfig;
use crate::error::{Error, Result};
use crate::retry::ExponentialWithMaxRetryCount;
use crate::types::ProofData;

/// How long to wait before the first poll.
const INITIAL_POLL_DELAY: Duration = Duration::from_secs(2);
/// How long to wait between polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How many polls before giving up on a proof job.
const MAX_POLL_ATTEMPTS: u32 = 30;

/// The coordinates of the event a proof is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofRequest {
    /// Numeric id of the source chain.
    pub src_chain_id: u64,
    /// Block the event was emitted in.
    pub src_block_number: u64,
    /// The log's position within its transaction receipt.
    pub global_log_index: u64,
}

/// Anything that can produce an inclusion proof for an observed event.
///
/// The queue holds this as a trait object so tests can substitute a stub.
#[async_trait::async_trait]
pub trait ProofBackend: Send + Sync {
    /// Requests and awaits a proof for the given event coordinates.
    async fn request_proof(&self, request: ProofRequest) -> Result<ProofData>;
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofRequestParams {
    src_chain_id: u64,
    src_block_number: u64,
    global_log_index: u64,
}

#[derive(Deserialize)]
struct ProofJobState {
    status: String,
    #[serde(default)]
    proof: Option<String>,
}

/// A client for the Polymer-style proof API.
///
/// A single instance, with its pooled HTTP connections, is shared by all
/// chains; the client is safe under concurrent calls.
pub struct PolymerProofClient {
    http: reqwest::Client,
    base_url: Url,
    retry_attempts: u32,
    api_key: Option<String>,
    initial_poll_delay: Duration,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl PolymerProofClient {
    /// Builds a client from the proof API configuration.
    pub fn new(config: &ProofApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            retry_attempts: config.retry_attempts,
            api_key: config.api_key.clone(),
            initial_poll_delay: INITIAL_POLL_DELAY,
            poll_interval: POLL_INTERVAL,
            max_poll_attempts: MAX_POLL_ATTEMPTS,
        })
    }

    /// Overrides the poll timing; only used to keep tests fast.
    #[cfg(test)]
    fn with_polling(mut self, initial: Duration, interval: Duration, attempts: u32) -> Self {
        self.initial_poll_delay = initial;
        self.poll_interval = interval;
        self.max_poll_attempts = attempts;
        self
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let mut request = self.http.post(self.base_url.clone()).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let response: RpcResponse<R> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(Error::Rpc(format!(
                "proof api rejected {method}: {} (code {})",
                err.message, err.code
            )));
        }
        response
            .result
            .ok_or_else(|| Error::Rpc(format!("proof api returned no result for {method}")))
    }

    async fn request_job(&self, request: ProofRequest) -> Result<u64> {
        let params = [ProofRequestParams {
            src_chain_id: request.src_chain_id,
            src_block_number: request.src_block_number,
            global_log_index: request.global_log_index,
        }];
        let policy =
            ExponentialWithMaxRetryCount::new(Duration::from_secs(1), self.retry_attempts as usize);
        backoff::future::retry(policy, || async {
            self.call::<_, u64>("polymer_requestProof", &params)
                .await
                .map_err(|e| {
                    tracing::warn!("proof request attempt failed: {e}");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| Error::ProofRequestFailed(e.one_line()))
    }

    async fn poll_job(&self, job_id: u64) -> Result<ProofData> {
        tokio::time::sleep(self.initial_poll_delay).await;
        for attempt in 1..=self.max_poll_attempts {
            match self.call::<_, ProofJobState>("polymer_queryProof", [job_id]).await {
                Ok(state) => match state.status.as_str() {
                    "complete" => {
                        let encoded = state.proof.unwrap_or_default();
                        if encoded.is_empty() {
                            return Err(Error::ProofGenerationFailed(format!(
                                "proof job {job_id} completed without a proof payload"
                            )));
                        }
                        let proof = BASE64.decode(encoded)?;
                        tracing::debug!(job_id, bytes = proof.len(), "proof ready");
                        return Ok(ProofData { proof });
                    }
                    "error" => {
                        return Err(Error::ProofGenerationFailed(format!(
                            "proof job {job_id} failed on the proof service"
                        )))
                    }
                    "initialized" | "pending" => {}
                    other => {
                        tracing::trace!(job_id, status = other, "unknown proof status, still waiting");
                    }
                },
                Err(e) => {
                    tracing::warn!(job_id, attempt, "proof poll failed: {e}");
                }
            }
            if attempt < self.max_poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(Error::ProofPollingTimeout {
            attempts: self.max_poll_attempts,
        })
    }
}

#[async_trait::async_trait]
impl ProofBackend for PolymerProofClient {
    #[tracing::instrument(
        skip_all,
        fields(
            chain_id = request.src_chain_id,
            block = request.src_block_number,
            log_index = request.global_log_index,
        ),
    )]
    async fn request_proof(&self, request: ProofRequest) -> Result<ProofData> {
        let job_id = self.request_job(request).await?;
        tracing::debug!(job_id, "proof job registered, polling");
        self.poll_job(job_id).await
    }
}
