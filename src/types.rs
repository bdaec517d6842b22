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
//! Core value types shared between the listener, the store, the queue and
//! the executor: decoded event snapshots, proof payloads, and the job status
//! state machine.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};

/// The status of a relay job.
///
/// Transitions only follow the state machine enforced by
/// [`JobStatus::can_transition_to`]; the job store rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Observed and persisted, not yet picked up.
    Pending,
    /// A proof has been requested from the proof service.
    ProofRequested,
    /// The proof is attached and the job is ready for execution.
    ProofReady,
    /// The destination transaction is being submitted.
    Executing,
    /// The destination transaction confirmed successfully. Terminal.
    Completed,
    /// The last attempt failed; retried while the budget lasts.
    Failed,
}

impl JobStatus {
    /// Whether a job in this status is never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    /// Whether moving from `self` to `next` is an edge of the job
    /// state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Pending, ProofRequested)
                | (Pending, Executing)
                | (ProofRequested, ProofReady)
                | (ProofRequested, Failed)
                | (ProofReady, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Failed, Pending)
                | (Failed, ProofReady)
        )
    }

    /// A stable single-byte tag, used by the store's status index.
    pub(crate) fn as_byte(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::ProofRequested => 1,
            JobStatus::ProofReady => 2,
            JobStatus::Executing => 3,
            JobStatus::Completed => 4,
            JobStatus::Failed => 5,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::ProofRequested => "proof_requested",
            JobStatus::ProofReady => "proof_ready",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A single decoded event argument.
///
/// Event arguments are heterogeneous, so they are carried as a tagged union.
/// Arbitrary-precision integers are stored as decimal strings so the values
/// survive JSON round trips without precision loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventValue {
    /// An unsigned integer, as a decimal string.
    Uint(String),
    /// A signed integer, as a decimal string.
    Int(String),
    /// A 20-byte account or contract address.
    Address(Address),
    /// A boolean flag.
    Bool(bool),
    /// A byte string (fixed or dynamic), hex-encoded on the wire.
    Bytes(Bytes),
    /// A UTF-8 string.
    String(String),
}

impl EventValue {
    /// The stringified form used when a resolver compares an argument
    /// against its mapping table.
    pub fn as_lookup_string(&self) -> String {
        match self {
            EventValue::Uint(s) | EventValue::Int(s) => s.clone(),
            EventValue::Address(a) => format!("{a:#x}"),
            EventValue::Bool(b) => b.to_string(),
            EventValue::Bytes(b) => format!("0x{}", hex::encode(b)),
            EventValue::String(s) => s.clone(),
        }
    }
}

/// A serialised snapshot of one decoded event, stored on the job.
///
/// `log_index` is the event's position among its transaction's matched logs
/// in the sweep filter, not the receipt-absolute index; the queue translates
/// it against the transaction receipt before requesting a proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// The event name, as declared in the mapping's signature.
    pub name: String,
    /// Decoded arguments, keyed by parameter name.
    pub args: BTreeMap<String, EventValue>,
    /// The block the event was emitted in.
    pub block_number: u64,
    /// The emitting transaction's index within its block.
    pub transaction_index: u64,
    /// Filter-local event position, see the type docs.
    pub log_index: u64,
}

/// An opaque inclusion proof obtained from the proof service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofData {
    /// The raw proof bytes, hex-encoded on the wire.
    #[serde(with = "hex::serde")]
    pub proof: Vec<u8>,
}
