use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::{Code, Status};

/// Machine-checkable category of a command rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    InvalidState,
}

impl std::fmt::Display for RejectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionType::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            RejectionType::NotFound => write!(f, "NOT_FOUND"),
            RejectionType::InvalidState => write!(f, "INVALID_STATE"),
        }
    }
}

/// A caller-correctable refusal to apply a command. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct Rejection {
    pub kind: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidArgument, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::NotFound, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }
}

/// Failure of a single request sent to a partition.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Command rejected: {0}")]
    Rejected(Rejection),

    #[error("Partition {partition_id} is exhausted, command queue is full")]
    ResourceExhausted { partition_id: u32 },

    #[error("Partition {partition_id} is unavailable")]
    Unavailable { partition_id: u32 },

    #[error("Request to partition {partition_id} timed out")]
    Timeout { partition_id: u32 },

    #[error("Partition {0} does not exist")]
    PartitionNotFound(u32),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BrokerError::ResourceExhausted { .. })
    }
}

impl From<Rejection> for BrokerError {
    fn from(rejection: Rejection) -> Self {
        BrokerError::Rejected(rejection)
    }
}

impl From<BrokerError> for Status {
    fn from(error: BrokerError) -> Self {
        let message = error.to_string();
        let code = match &error {
            BrokerError::Rejected(rejection) => match rejection.kind {
                RejectionType::InvalidArgument => Code::InvalidArgument,
                RejectionType::NotFound => Code::NotFound,
                RejectionType::InvalidState => Code::FailedPrecondition,
            },
            BrokerError::ResourceExhausted { .. } => Code::ResourceExhausted,
            BrokerError::Unavailable { .. } | BrokerError::PartitionNotFound(_) => {
                Code::Unavailable
            }
            BrokerError::Timeout { .. } => Code::DeadlineExceeded,
            BrokerError::Internal(_) => Code::Internal,
        };
        Status::new(code, message)
    }
}

#[derive(Error, Debug)]
pub enum JobflowError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("gRPC status: {0}")]
    Status(#[from] Status),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobflowError>;
