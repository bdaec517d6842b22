use ethers::types::H256;

use crate::types::JobStatus;

/// An enum of all possible errors that could be encountered during the
/// execution of the relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error while parsing the config file, with the offending path.
    #[error("config parse error: {0}")]
    ParseConfig(#[from] serde_path_to_error::Error<serde_json::Error>),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error in the underlying HTTP client.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// ABI encoding or decoding error.
    #[error(transparent)]
    Abi(#[from] ethers::abi::Error),
    /// Base64 decoding error, from the proof service payload.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    /// Elliptic curve error while loading a signing key.
    #[error(transparent)]
    EllipticCurve(#[from] ethers::core::k256::elliptic_curve::Error),
    /// Ether wallet errors.
    #[error(transparent)]
    Wallet(#[from] ethers::signers::WalletError),
    /// The configuration is invalid; fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A chain referenced at runtime is not configured.
    #[error("chain not found: {chain}")]
    ChainNotFound {
        /// The missing chain's configured name.
        chain: String,
    },
    /// A chain RPC call failed or was rejected.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// A destination resolver could not map the event.
    #[error("resolver error: {0}")]
    Resolver(String),
    /// The proof request phase failed after its retry budget.
    #[error("proof request failed: {0}")]
    ProofRequestFailed(String),
    /// The proof polling phase exhausted its attempts.
    #[error("proof polling timed out after {attempts} attempts")]
    ProofPollingTimeout {
        /// How many polls were made before giving up.
        attempts: u32,
    },
    /// The proof service reported a failed proof generation.
    #[error("proof generation failed: {0}")]
    ProofGenerationFailed(String),
    /// A method signature or argument could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// The destination transaction was mined but reverted.
    #[error("transaction {tx_hash:#x} reverted on the destination chain")]
    ExecutionReverted {
        /// Hash of the reverted transaction.
        tx_hash: H256,
    },
    /// A job with the same unique id already exists.
    #[error("duplicate job: {unique_id}")]
    DuplicateJob {
        /// The colliding unique id.
        unique_id: String,
    },
    /// No job with the given id exists in the store.
    #[error("job not found: {id}")]
    JobNotFound {
        /// The missing job id.
        id: u64,
    },
    /// A status update does not follow the job state machine.
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        /// The job's current status.
        from: JobStatus,
        /// The rejected target status.
        to: JobStatus,
    },
    /// Missing secrets in the config, e.g. the chain's private key.
    #[error("missing required private key in the config")]
    MissingSecrets,
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

impl Error {
    /// A one-line rendering, suitable for a job's `error_message` column.
    pub fn one_line(&self) -> String {
        let rendered = self.to_string();
        match rendered.split_once('\n') {
            Some((first, _)) => first.to_string(),
            None => rendered,
        }
    }
}

/// A type alias for the result used across the relayer.
pub type Result<T> = std::result::Result<T, Error>;
