//! Wire format between canvas clients and a room.
//!
//! Inbound frames are `{"type": ..., "data": {...}}`; outbound frames are
//! envelopes `{"id", "name", "type", "data"}` where `id`/`name` identify the
//! room instance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::RequestError;
use crate::region::{validate_update, CellUpdate, RegionKey};

/// A decoded, validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe { regions: Vec<RegionKey> },
    Unsubscribe { regions: Vec<RegionKey> },
    Load { regions: Vec<RegionKey> },
    Update { updates: Vec<CellUpdate> },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Load { .. } => "load",
            Self::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    data: Map<String, Value>,
}

/// Decode one inbound frame. `max_regions` caps `subscribe` and `load`
/// requests.
pub fn decode(payload: &str, max_regions: usize) -> Result<ClientCommand, RequestError> {
    let raw: RawMessage =
        serde_json::from_str(payload).map_err(|_| RequestError::MalformedMessage)?;

    match raw.kind.as_str() {
        "subscribe" => Ok(ClientCommand::Subscribe {
            regions: region_list(&raw.data, Some(max_regions))?,
        }),
        "unsubscribe" => Ok(ClientCommand::Unsubscribe {
            regions: region_list(&raw.data, None)?,
        }),
        "load" => Ok(ClientCommand::Load {
            regions: region_list(&raw.data, Some(max_regions))?,
        }),
        "update" => Ok(ClientCommand::Update {
            updates: update_list(&raw.data)?,
        }),
        _ => Err(RequestError::UnknownMessageType(raw.kind)),
    }
}

fn non_empty_list<'a>(
    data: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Vec<Value>, RequestError> {
    let items = data
        .get(field)
        .and_then(Value::as_array)
        .ok_or(RequestError::MalformedRequest)?;
    if items.is_empty() {
        return Err(RequestError::EmptyRequest);
    }
    Ok(items)
}

fn region_list(
    data: &Map<String, Value>,
    limit: Option<usize>,
) -> Result<Vec<RegionKey>, RequestError> {
    let items = non_empty_list(data, "regions")?;
    if let Some(limit) = limit {
        if items.len() > limit {
            return Err(RequestError::TooManyRegions {
                requested: items.len(),
                limit,
            });
        }
    }
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|raw| RegionKey::parse(raw).ok())
                .ok_or_else(|| RequestError::InvalidRegion(item.to_string()))
        })
        .collect()
}

fn update_list(data: &Map<String, Value>) -> Result<Vec<CellUpdate>, RequestError> {
    non_empty_list(data, "updates")?
        .iter()
        .map(|item| validate_update(item).ok_or(RequestError::InvalidUpdate))
        .collect()
}

/// Stable identity of a room instance, supplied by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    pub id: String,
    pub name: String,
}

/// Events a room sends to its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Error {
        error: String,
    },
    Subscriptions {
        #[serde(rename = "subscribedRegions")]
        subscribed_regions: Vec<RegionKey>,
        #[serde(rename = "unsubscribedRegions")]
        unsubscribed_regions: Vec<RegionKey>,
    },
    RegionData {
        regions: BTreeMap<RegionKey, Option<String>>,
    },
    Update(CellUpdate),
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    name: &'a str,
    #[serde(flatten)]
    event: &'a ServerEvent,
}

/// Wrap an event in the room envelope and render it as a text frame.
pub fn encode(identity: &RoomIdentity, event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        id: &identity.id,
        name: &identity.name,
        event,
    })
}
