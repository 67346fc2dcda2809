//! Versioned connection attachment.
//!
//! Decoding is defensive: anything that is not a current-version record with
//! canonical region keys is treated as "no prior state".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::region::RegionKey;
use crate::subscriptions::reconcile;

pub const ATTACHMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AttachmentRecord {
    version: u32,
    #[serde(rename = "subscribedRegions")]
    subscribed_regions: Vec<RegionKey>,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("no attachment stored")]
    Missing,
    #[error("unsupported attachment version {0}")]
    Version(u32),
    #[error("invalid attachment: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn encode_attachment(subscribed_regions: &[RegionKey]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&AttachmentRecord {
        version: ATTACHMENT_VERSION,
        subscribed_regions: subscribed_regions.to_vec(),
    })
}

/// Recover a subscription list, deduplicated and trimmed to `cap` (oldest
/// dropped first).
pub fn decode_attachment(raw: Option<&str>, cap: usize) -> Result<Vec<RegionKey>, AttachmentError> {
    let raw = raw.ok_or(AttachmentError::Missing)?;
    let record: AttachmentRecord = serde_json::from_str(raw)?;
    if record.version != ATTACHMENT_VERSION {
        return Err(AttachmentError::Version(record.version));
    }
    Ok(reconcile(&[], &record.subscribed_regions, cap).retained)
}
