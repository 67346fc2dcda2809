//! Room hosts: one tokio task per live room name.
//!
//! A host owns the transport table (every open socket and its attachment) and
//! an optional [`Room`]. Commands are handled strictly one at a time. After
//! `hibernate_after` without socket commands the room is dropped and rebuilt from the
//! transport table on the next command; a host with no sockets left exits
//! and removes itself from the registry.

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::RoomIdentity;
use crate::region::MAX_ACTIVE_REGIONS;
use crate::room::Room;
use crate::storage::{RegionBridge, SharedRegionStore};

const MAX_ROOM_NAME_LEN: usize = 64;
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomNameError {
    #[error("room name is empty")]
    Empty,
    #[error("room name is longer than 64 characters")]
    TooLong,
    #[error("room name contains invalid character {0:?}")]
    InvalidCharacter(char),
}

pub fn validate_room_name(name: &str) -> Result<(), RoomNameError> {
    if name.is_empty() {
        return Err(RoomNameError::Empty);
    }
    if name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(RoomNameError::TooLong);
    }
    match name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
    {
        Some(ch) => Err(RoomNameError::InvalidCharacter(ch)),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    InvalidName(#[from] RoomNameError),
    #[error("room {0} is unavailable")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub max_active_regions: usize,
    pub hibernate_after: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_active_regions: MAX_ACTIVE_REGIONS,
            hibernate_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub id: String,
    pub name: String,
    pub connections: usize,
    pub active_regions: usize,
    pub dormant: bool,
}

enum RoomCommand {
    Open {
        handle: ConnectionHandle,
        ack: oneshot::Sender<()>,
    },
    Message {
        connection: ConnectionId,
        payload: String,
    },
    Close {
        connection: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
}

impl RoomCommand {
    fn is_activity(&self) -> bool {
        !matches!(self, RoomCommand::Stats { .. })
    }
}

/// Sending side of a running room host.
#[derive(Clone)]
pub struct RoomHandle {
    identity: RoomIdentity,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn identity(&self) -> &RoomIdentity {
        &self.identity
    }

    /// Queue an inbound frame. Returns false once the host has stopped.
    pub fn message(&self, connection: ConnectionId, payload: String) -> bool {
        self.commands
            .send(RoomCommand::Message {
                connection,
                payload,
            })
            .is_ok()
    }

    pub fn close(&self, connection: ConnectionId) {
        let _ = self.commands.send(RoomCommand::Close { connection });
    }

    pub async fn stats(&self) -> Option<RoomStats> {
        let (reply, stats) = oneshot::channel();
        self.commands.send(RoomCommand::Stats { reply }).ok()?;
        stats.await.ok()
    }
}

struct RegistryInner {
    rooms: DashMap<String, RoomHandle>,
    store: SharedRegionStore,
    settings: RoomSettings,
}

/// Maps room names to running hosts, starting hosts on demand.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(store: SharedRegionStore, settings: RoomSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                store,
                settings,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rooms.is_empty()
    }

    /// Attach a socket to the named room, starting its host if needed. A
    /// host that shut down between lookup and open is replaced.
    pub async fn join(
        &self,
        name: &str,
        connection: ConnectionHandle,
    ) -> Result<RoomHandle, JoinError> {
        validate_room_name(name)?;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.host(name);
            let (ack, opened) = oneshot::channel();
            let sent = room
                .commands
                .send(RoomCommand::Open {
                    handle: connection.clone(),
                    ack,
                })
                .is_ok();
            if sent && opened.await.is_ok() {
                return Ok(room);
            }
            debug!(room = %name, host = %room.identity.id, "room host gone, retrying join");
            self.inner
                .rooms
                .remove_if(name, |_, current| current.identity.id == room.identity.id);
        }
        Err(JoinError::Unavailable(name.to_string()))
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let hosts: Vec<RoomHandle> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut stats = Vec::with_capacity(hosts.len());
        for host in hosts {
            if let Some(entry) = host.stats().await {
                stats.push(entry);
            }
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn host(&self, name: &str) -> RoomHandle {
        self.inner
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| self.spawn_host(name))
            .clone()
    }

    fn spawn_host(&self, name: &str) -> RoomHandle {
        let identity = RoomIdentity {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        let (commands, inbox) = mpsc::unbounded_channel();
        let host = RoomHost {
            identity: identity.clone(),
            bridge: RegionBridge::new(self.inner.store.clone(), name),
            settings: self.inner.settings,
            registry: Arc::downgrade(&self.inner),
            transport: HashMap::new(),
            room: None,
        };
        info!(room = %identity.name, host = %identity.id, "starting room host");
        tokio::spawn(host.run(inbox));
        RoomHandle { identity, commands }
    }
}

struct RoomHost {
    identity: RoomIdentity,
    bridge: RegionBridge,
    settings: RoomSettings,
    registry: Weak<RegistryInner>,
    transport: HashMap<ConnectionId, ConnectionHandle>,
    room: Option<Room>,
}

impl RoomHost {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RoomCommand>) {
        // Only socket traffic counts as activity; stats polls never delay
        // hibernation or shutdown.
        let mut last_activity = Instant::now();
        loop {
            let idle_deadline = last_activity + self.settings.hibernate_after;
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => {
                        if command.is_activity() {
                            last_activity = Instant::now();
                        }
                        self.handle(command).await;
                    }
                    None => break,
                },
                _ = sleep_until(idle_deadline) => {
                    if self.room.take().is_some() {
                        counter!("canvas_road_room_hibernations_total", 1);
                        info!(
                            room = %self.identity.name,
                            connections = self.transport.len(),
                            "room hibernated"
                        );
                    }
                    if self.transport.is_empty() {
                        self.unregister(&mut inbox).await;
                        break;
                    }
                    last_activity = Instant::now();
                }
            }
        }
        info!(room = %self.identity.name, host = %self.identity.id, "room host stopped");
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Open { handle, ack } => {
                let id = handle.id;
                self.room_mut().open(handle.clone());
                self.transport.insert(id, handle);
                if ack.send(()).is_err() {
                    self.forget(&id);
                }
            }
            RoomCommand::Message {
                connection,
                payload,
            } => {
                if !self.transport.contains_key(&connection) {
                    warn!(room = %self.identity.name, connection = %connection, "message for unknown connection");
                    return;
                }
                self.room_mut().handle_message(connection, &payload).await;
            }
            RoomCommand::Close { connection } => self.forget(&connection),
            RoomCommand::Stats { reply } => {
                let _ = reply.send(RoomStats {
                    id: self.identity.id.clone(),
                    name: self.identity.name.clone(),
                    connections: self.transport.len(),
                    active_regions: self
                        .room
                        .as_ref()
                        .map(Room::active_region_count)
                        .unwrap_or(0),
                    dormant: self.room.is_none(),
                });
            }
        }
    }

    fn room_mut(&mut self) -> &mut Room {
        let Self {
            identity,
            bridge,
            settings,
            transport,
            room,
            ..
        } = self;
        room.get_or_insert_with(|| {
            Room::revive(
                identity.clone(),
                bridge.clone(),
                settings.max_active_regions,
                transport
                    .values()
                    .filter(|handle| !handle.is_closed())
                    .cloned(),
            )
        })
    }

    fn forget(&mut self, id: &ConnectionId) {
        if self.transport.remove(id).is_none() {
            return;
        }
        if let Some(room) = self.room.as_mut() {
            room.close(id);
        }
    }

    /// Leave the registry, then turn away anything queued in the meantime.
    /// Dropping an `Open` ack makes the joiner retry on a fresh host.
    async fn unregister(&mut self, inbox: &mut mpsc::UnboundedReceiver<RoomCommand>) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .rooms
                .remove_if(&self.identity.name, |_, current| current.identity.id == self.identity.id);
        }
        inbox.close();
        while let Some(command) = inbox.recv().await {
            if let RoomCommand::Open { handle, .. } = command {
                debug!(room = %self.identity.name, connection = %handle.id, "turning away join on stopped host");
            }
        }
    }
}
