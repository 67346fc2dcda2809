use thiserror::Error;

use crate::region::RegionKey;
use crate::storage::StoreError;

/// Problems with what a client sent. Reported back to that client in an
/// `error` envelope; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("malformed message")]
    MalformedMessage,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("malformed request")]
    MalformedRequest,
    #[error("empty request")]
    EmptyRequest,
    #[error("too many regions: {requested} requested, limit is {limit}")]
    TooManyRegions { requested: usize, limit: usize },
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("invalid update")]
    InvalidUpdate,
    #[error("not subscribed to region {0}")]
    NotSubscribed(RegionKey),
}

impl RequestError {
    /// Stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed_message",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::MalformedRequest => "malformed_request",
            Self::EmptyRequest => "empty_request",
            Self::TooManyRegions { .. } => "too_many_regions",
            Self::InvalidRegion(_) => "invalid_region",
            Self::InvalidUpdate => "invalid_update",
            Self::NotSubscribed(_) => "not_subscribed",
        }
    }
}

/// Failures inside the server while reading or writing region content.
/// Never caused by client input; the detail is logged, not sent.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region {region} has {found} cells, expected {expected}")]
    SizeInvariantViolated {
        region: RegionKey,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a single command failed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Text sent to a client when an internal failure aborted its request.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";
