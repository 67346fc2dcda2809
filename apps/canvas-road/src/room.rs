//! Room actor: owns every live connection of one room, their subscriptions
//! and the region → subscribers index.
//!
//! All methods take `&mut self`; callers serialise access (the room host runs
//! one command at a time). After every mutation a connection `c` is listed
//! under region `r` in the index exactly when `r` is in `c`'s subscription
//! list.

use metrics::{counter, gauge};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::attachment::{decode_attachment, encode_attachment, AttachmentError};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{CommandError, RequestError, INTERNAL_ERROR_MESSAGE};
use crate::protocol::{decode, encode, ClientCommand, RoomIdentity, ServerEvent};
use crate::region::{blank_cells, CellUpdate, RegionKey};
use crate::storage::RegionBridge;
use crate::subscriptions::{reconcile, unsubscribe, Reconciled, SubscriptionIndex};

struct Connection {
    handle: ConnectionHandle,
    subscribed_regions: Vec<RegionKey>,
}

pub struct Room {
    identity: RoomIdentity,
    bridge: RegionBridge,
    max_active_regions: usize,
    connections: HashMap<ConnectionId, Connection>,
    index: SubscriptionIndex,
    /// Cell buffers of regions edited while subscribed; dropped with the
    /// index entry.
    cache: HashMap<RegionKey, Vec<char>>,
}

impl Room {
    pub fn new(identity: RoomIdentity, bridge: RegionBridge, max_active_regions: usize) -> Self {
        Self {
            identity,
            bridge,
            max_active_regions,
            connections: HashMap::new(),
            index: SubscriptionIndex::new(),
            cache: HashMap::new(),
        }
    }

    /// Rebuild a room from sockets that stayed open while it was dormant.
    /// Each connection gets back the subscriptions stored in its attachment;
    /// an unreadable attachment means starting with none.
    pub fn revive(
        identity: RoomIdentity,
        bridge: RegionBridge,
        max_active_regions: usize,
        open: impl IntoIterator<Item = ConnectionHandle>,
    ) -> Self {
        let mut room = Self::new(identity, bridge, max_active_regions);
        for handle in open {
            let stored = handle.attachment().load();
            let regions = match decode_attachment(stored.as_deref(), max_active_regions) {
                Ok(regions) => regions,
                Err(AttachmentError::Missing) => Vec::new(),
                Err(err) => {
                    warn!(
                        room = %room.identity.name,
                        connection = %handle.id,
                        error = %err,
                        "discarding unreadable attachment"
                    );
                    Vec::new()
                }
            };
            let id = handle.id;
            room.connections.insert(
                id,
                Connection {
                    handle,
                    subscribed_regions: Vec::new(),
                },
            );
            room.set_subscriptions(id, regions);
        }
        info!(
            room = %room.identity.name,
            connections = room.connections.len(),
            regions = room.index.len(),
            "room revived"
        );
        room
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn active_region_count(&self) -> usize {
        self.index.len()
    }

    pub fn subscriptions(&self, id: &ConnectionId) -> &[RegionKey] {
        self.connections
            .get(id)
            .map(|connection| connection.subscribed_regions.as_slice())
            .unwrap_or_default()
    }

    pub fn subscribers(&self, region: &RegionKey) -> &[ConnectionId] {
        self.index.subscribers(region)
    }

    pub fn index_snapshot(&self) -> BTreeMap<RegionKey, BTreeSet<ConnectionId>> {
        self.index.snapshot()
    }

    pub fn is_region_cached(&self, region: &RegionKey) -> bool {
        self.cache.contains_key(region)
    }

    /// Check the two-way agreement between subscription lists and the index.
    pub fn is_consistent(&self) -> bool {
        let forward: BTreeMap<RegionKey, BTreeSet<ConnectionId>> =
            self.connections
                .iter()
                .fold(BTreeMap::new(), |mut acc, (id, connection)| {
                    for region in &connection.subscribed_regions {
                        acc.entry(*region).or_insert_with(BTreeSet::new).insert(*id);
                    }
                    acc
                });
        let bounded = self.connections.values().all(|connection| {
            let unique: HashSet<_> = connection.subscribed_regions.iter().collect();
            unique.len() == connection.subscribed_regions.len()
                && connection.subscribed_regions.len() <= self.max_active_regions
        });
        let cache_scoped = self.cache.keys().all(|region| self.index.contains(region));
        bounded && cache_scoped && forward == self.index.snapshot()
    }

    /// Admit a freshly upgraded socket with no subscriptions.
    pub fn open(&mut self, handle: ConnectionHandle) {
        let id = handle.id;
        if self.connections.contains_key(&id) {
            return;
        }
        self.connections.insert(
            id,
            Connection {
                handle,
                subscribed_regions: Vec::new(),
            },
        );
        self.persist_attachment(&id);
        counter!("canvas_road_connections_total", 1, "room" => self.identity.name.clone());
        self.record_connection_gauge();
        debug!(room = %self.identity.name, connection = %id, "connection opened");
        debug_assert!(self.is_consistent());
    }

    /// Forget a connection and drop it from every region it subscribed to.
    pub fn close(&mut self, id: &ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(id) else {
            return false;
        };
        for region in &connection.subscribed_regions {
            self.detach(region, id);
        }
        self.record_connection_gauge();
        debug!(
            room = %self.identity.name,
            connection = %id,
            regions = connection.subscribed_regions.len(),
            "connection closed"
        );
        debug_assert!(self.is_consistent());
        true
    }

    /// Decode and run one inbound frame from `id`. Failures are answered on
    /// that connection only.
    pub async fn handle_message(&mut self, id: ConnectionId, payload: &str) {
        if !self.connections.contains_key(&id) {
            warn!(room = %self.identity.name, connection = %id, "message from unknown connection");
            return;
        }

        let result = match decode(payload, self.max_active_regions) {
            Ok(command) => {
                debug!(
                    room = %self.identity.name,
                    connection = %id,
                    command = command.name(),
                    "handling command"
                );
                self.dispatch(id, command).await
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(()) => {}
            Err(CommandError::Request(err)) => {
                debug!(room = %self.identity.name, connection = %id, error = %err, "rejected request");
                counter!("canvas_road_client_errors_total", 1, "kind" => err.kind());
                self.send_to(
                    &id,
                    &ServerEvent::Error {
                        error: err.to_string(),
                    },
                );
            }
            Err(CommandError::Region(err)) => {
                error!(room = %self.identity.name, connection = %id, error = %err, "region operation failed");
                self.send_to(
                    &id,
                    &ServerEvent::Error {
                        error: INTERNAL_ERROR_MESSAGE.to_string(),
                    },
                );
            }
        }
        debug_assert!(self.is_consistent());
    }

    async fn dispatch(&mut self, id: ConnectionId, command: ClientCommand) -> Result<(), CommandError> {
        match command {
            ClientCommand::Subscribe { regions } => self.subscribe(id, regions).await,
            ClientCommand::Unsubscribe { regions } => {
                self.unsubscribe(id, regions);
                Ok(())
            }
            ClientCommand::Load { regions } => self.load(id, regions).await,
            ClientCommand::Update { updates } => self.update(id, updates).await,
        }
    }

    async fn subscribe(&mut self, id: ConnectionId, requested: Vec<RegionKey>) -> Result<(), CommandError> {
        let existing = self.subscriptions(&id).to_vec();
        let Reconciled { retained, evicted } =
            reconcile(&existing, &requested, self.max_active_regions);
        let added = self.set_subscriptions(id, retained.clone());

        self.send_to(
            &id,
            &ServerEvent::Subscriptions {
                subscribed_regions: retained,
                unsubscribed_regions: evicted,
            },
        );

        if !added.is_empty() {
            let regions = self.region_content(&added).await?;
            self.send_to(&id, &ServerEvent::RegionData { regions });
        }
        Ok(())
    }

    fn unsubscribe(&mut self, id: ConnectionId, regions: Vec<RegionKey>) {
        let existing = self.subscriptions(&id).to_vec();
        let remaining = unsubscribe(&existing, &regions);
        let removed: Vec<RegionKey> = existing
            .iter()
            .filter(|region| !remaining.contains(region))
            .copied()
            .collect();
        self.set_subscriptions(id, remaining.clone());

        self.send_to(
            &id,
            &ServerEvent::Subscriptions {
                subscribed_regions: remaining,
                unsubscribed_regions: removed,
            },
        );
    }

    async fn load(&mut self, id: ConnectionId, regions: Vec<RegionKey>) -> Result<(), CommandError> {
        let regions = self.region_content(&regions).await?;
        self.send_to(&id, &ServerEvent::RegionData { regions });
        Ok(())
    }

    async fn update(&mut self, id: ConnectionId, updates: Vec<CellUpdate>) -> Result<(), CommandError> {
        let subscribed = self.subscriptions(&id);
        if let Some(update) = updates
            .iter()
            .find(|update| !subscribed.contains(&update.region))
        {
            return Err(RequestError::NotSubscribed(update.region).into());
        }

        let mut touched = Vec::new();
        for update in &updates {
            if !touched.contains(&update.region) {
                touched.push(update.region);
            }
        }
        self.cache_regions(&touched).await?;

        counter!("canvas_road_updates_total", updates.len() as u64, "room" => self.identity.name.clone());
        for update in &updates {
            if let Some(cell) = self
                .cache
                .get_mut(&update.region)
                .and_then(|cells| cells.get_mut(update.position.offset()))
            {
                *cell = update.value;
            }
            self.broadcast_update(&id, update);
        }

        for region in &touched {
            let Some(cells) = self.cache.get(region) else {
                continue;
            };
            let content: String = cells.iter().collect();
            self.bridge.save(region, &content).await?;
        }
        Ok(())
    }

    /// Send `update` to every subscriber of its region except the author.
    fn broadcast_update(&mut self, author: &ConnectionId, update: &CellUpdate) {
        let event = ServerEvent::Update(*update);
        let frame = match encode(&self.identity, &event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(room = %self.identity.name, error = %err, "failed to encode update");
                return;
            }
        };

        let mut stale = Vec::new();
        let mut delivered = 0u64;
        for recipient in self.index.subscribers(&update.region) {
            if recipient == author {
                continue;
            }
            let Some(connection) = self.connections.get(recipient) else {
                continue;
            };
            match connection.handle.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => stale.push(*recipient),
            }
        }

        counter!("canvas_road_deliveries_total", delivered, "room" => self.identity.name.clone());
        for recipient in stale {
            warn!(room = %self.identity.name, connection = %recipient, "dropping stale recipient");
            counter!("canvas_road_stale_recipients_total", 1, "room" => self.identity.name.clone());
            self.close(&recipient);
        }
    }

    /// Replace a connection's subscription list and update the index to
    /// match. Returns the regions that were newly added.
    fn set_subscriptions(&mut self, id: ConnectionId, next: Vec<RegionKey>) -> Vec<RegionKey> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Vec::new();
        };
        let previous = std::mem::replace(&mut connection.subscribed_regions, next);
        let current = connection.subscribed_regions.clone();

        for region in previous.iter().filter(|region| !current.contains(region)) {
            self.detach(region, &id);
        }
        let added: Vec<RegionKey> = current
            .iter()
            .filter(|region| !previous.contains(region))
            .copied()
            .collect();
        for region in &added {
            self.index.insert(*region, id);
        }

        self.persist_attachment(&id);
        added
    }

    fn detach(&mut self, region: &RegionKey, id: &ConnectionId) {
        if self.index.remove(region, id) && self.cache.remove(region).is_some() {
            debug!(room = %self.identity.name, region = %region, "unloaded region");
        }
    }

    fn persist_attachment(&self, id: &ConnectionId) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        match encode_attachment(&connection.subscribed_regions) {
            Ok(raw) => connection.handle.attachment().store(raw),
            Err(err) => {
                error!(room = %self.identity.name, connection = %id, error = %err, "failed to encode attachment")
            }
        }
    }

    /// Make sure every region in `regions` has a cell buffer.
    async fn cache_regions(&mut self, regions: &[RegionKey]) -> Result<(), CommandError> {
        let missing: Vec<RegionKey> = regions
            .iter()
            .filter(|region| !self.cache.contains_key(region))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for (region, content) in self.bridge.load(&missing).await? {
            let cells = content
                .map(|content| content.chars().collect())
                .unwrap_or_else(blank_cells);
            self.cache.insert(region, cells);
        }
        Ok(())
    }

    /// Current content of each region, from the cache when it has one.
    async fn region_content(
        &self,
        regions: &[RegionKey],
    ) -> Result<BTreeMap<RegionKey, Option<String>>, CommandError> {
        let mut content = BTreeMap::new();
        let mut uncached = Vec::new();
        for region in regions {
            match self.cache.get(region) {
                Some(cells) => {
                    let text: String = cells.iter().collect();
                    let value = (!text.trim().is_empty()).then_some(text);
                    content.insert(*region, value);
                }
                None => uncached.push(*region),
            }
        }
        if !uncached.is_empty() {
            content.extend(self.bridge.load(&uncached).await?);
        }
        Ok(content)
    }

    fn send_to(&mut self, id: &ConnectionId, event: &ServerEvent) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let frame = match encode(&self.identity, event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(room = %self.identity.name, error = %err, "failed to encode event");
                return;
            }
        };
        if connection.handle.send(frame).is_err() {
            warn!(room = %self.identity.name, connection = %id, "connection went away");
            self.close(id);
        }
    }

    fn record_connection_gauge(&self) {
        gauge!(
            "canvas_road_connections_active",
            self.connections.len() as f64,
            "room" => self.identity.name.clone()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Position, REGION_CELLS};
    use crate::storage::{MemoryRegionStore, RegionStore};
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const MAX: usize = 4;

    struct Client {
        handle: ConnectionHandle,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                handle: ConnectionHandle::new(tx),
                rx,
            }
        }

        fn id(&self) -> ConnectionId {
            self.handle.id
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
            frames
        }
    }

    fn identity() -> RoomIdentity {
        RoomIdentity {
            id: "room-id".into(),
            name: "lobby".into(),
        }
    }

    fn room_with(store: Arc<MemoryRegionStore>) -> Room {
        Room::new(identity(), RegionBridge::new(store, "lobby"), MAX)
    }

    fn key(col: i32, row: i32) -> RegionKey {
        RegionKey::new(col, row)
    }

    fn subscribe_msg(regions: &[&str]) -> String {
        json!({"type": "subscribe", "data": {"regions": regions}}).to_string()
    }

    fn update_msg(region: &str, x: u32, y: u32, value: &str) -> String {
        json!({"type": "update", "data": {"updates": [
            {"region": region, "position": {"x": x, "y": y}, "value": value, "author": "spoofed"}
        ]}})
        .to_string()
    }

    async fn open_subscribed(room: &mut Room, regions: &[&str]) -> Client {
        let mut client = Client::new();
        room.open(client.handle.clone());
        room.handle_message(client.id(), &subscribe_msg(regions)).await;
        client.drain();
        client
    }

    #[tokio::test]
    async fn subscribe_replies_and_pushes_region_data() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let bridge = RegionBridge::new(store.clone(), "lobby");
        let mut cells = blank_cells();
        cells[0] = 'h';
        bridge
            .save(&key(1, 1), &cells.iter().collect::<String>())
            .await
            .unwrap();

        let mut client = Client::new();
        room.open(client.handle.clone());
        room.handle_message(client.id(), &subscribe_msg(&["1-1", "2-2"]))
            .await;

        let frames = client.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], "room-id");
        assert_eq!(frames[0]["name"], "lobby");
        assert_eq!(frames[0]["type"], "subscriptions");
        assert_eq!(
            frames[0]["data"],
            json!({"subscribedRegions": ["1-1", "2-2"], "unsubscribedRegions": []})
        );
        assert_eq!(frames[1]["type"], "regionData");
        assert_eq!(frames[1]["data"]["regions"]["2-2"], Value::Null);
        let content = frames[1]["data"]["regions"]["1-1"].as_str().unwrap();
        assert!(content.starts_with('h'));
        assert_eq!(content.chars().count(), REGION_CELLS);

        assert_eq!(room.subscriptions(&client.id()), &[key(1, 1), key(2, 2)]);
        assert_eq!(room.subscribers(&key(1, 1)), &[client.id()]);
        assert_eq!(
            decode_attachment(client.handle.attachment().load().as_deref(), MAX).unwrap(),
            vec![key(1, 1), key(2, 2)]
        );
    }

    #[tokio::test]
    async fn resubscribe_keeps_order_and_skips_region_data() {
        let mut room = room_with(MemoryRegionStore::new());
        let mut client = open_subscribed(&mut room, &["0-0", "0-1"]).await;

        room.handle_message(client.id(), &subscribe_msg(&["0-0"])).await;
        let frames = client.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0]["data"]["subscribedRegions"],
            json!(["0-0", "0-1"])
        );
        assert_eq!(room.subscriptions(&client.id()), &[key(0, 0), key(0, 1)]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_and_reports_them() {
        let mut room = room_with(MemoryRegionStore::new());
        let mut client = open_subscribed(&mut room, &["0-0", "0-1", "0-2"]).await;

        room.handle_message(client.id(), &subscribe_msg(&["0-3", "0-4", "0-5"]))
            .await;
        let frames = client.drain();
        assert_eq!(
            frames[0]["data"],
            json!({
                "subscribedRegions": ["0-2", "0-3", "0-4", "0-5"],
                "unsubscribedRegions": ["0-0", "0-1"]
            })
        );
        let pushed = frames[1]["data"]["regions"].as_object().unwrap();
        assert_eq!(pushed.len(), 3);
        assert!(!room.index_snapshot().contains_key(&key(0, 0)));
        assert!(!room.index_snapshot().contains_key(&key(0, 1)));
        assert_eq!(room.active_region_count(), 4);
        assert!(room.is_consistent());
    }

    #[tokio::test]
    async fn invalid_requests_get_error_envelopes() {
        let mut room = room_with(MemoryRegionStore::new());
        let mut client = Client::new();
        room.open(client.handle.clone());

        let cases = [
            ("garbage".to_string(), "malformed message"),
            (json!({"type": "paint", "data": {}}).to_string(), "unknown message type: paint"),
            (json!({"type": "subscribe", "data": {}}).to_string(), "malformed request"),
            (subscribe_msg(&[]), "empty request"),
            (
                subscribe_msg(&["0-0", "0-1", "0-2", "0-3", "0-4"]),
                "too many regions: 5 requested, limit is 4",
            ),
            (subscribe_msg(&["0-0", "a-b"]), "invalid region: \"a-b\""),
            (update_msg("0-0", 1, 1, "ab"), "invalid update"),
            (update_msg("0-0", 1, 1, "a"), "not subscribed to region 0-0"),
        ];
        for (payload, expected) in cases {
            room.handle_message(client.id(), &payload).await;
            let frames = client.drain();
            assert_eq!(frames.len(), 1, "{payload}");
            assert_eq!(frames[0]["type"], "error");
            assert_eq!(frames[0]["data"]["error"], expected);
        }
        assert!(room.subscriptions(&client.id()).is_empty());
        assert_eq!(room.connection_count(), 1);
    }

    #[tokio::test]
    async fn update_reaches_other_subscribers_without_echo() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let mut a = open_subscribed(&mut room, &["1-1"]).await;
        let mut b = open_subscribed(&mut room, &["1-1"]).await;
        let mut c = open_subscribed(&mut room, &["2-2"]).await;

        room.handle_message(a.id(), &update_msg("1-1", 3, 2, "z")).await;

        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
        let frames = b.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "update");
        assert_eq!(
            frames[0]["data"],
            json!({"region": "1-1", "position": {"x": 3, "y": 2}, "value": "z"})
        );

        let stored = store
            .get("canvas:lobby:region:1-1")
            .await
            .unwrap()
            .unwrap();
        let cells: Vec<char> = stored.chars().collect();
        assert_eq!(cells[Position { x: 3, y: 2 }.offset()], 'z');
        assert!(room.is_region_cached(&key(1, 1)));
    }

    #[tokio::test]
    async fn batch_with_unsubscribed_region_is_rejected_whole() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let mut a = open_subscribed(&mut room, &["1-1"]).await;
        let mut b = open_subscribed(&mut room, &["1-1", "2-2"]).await;

        let payload = json!({"type": "update", "data": {"updates": [
            {"region": "1-1", "position": {"x": 0, "y": 0}, "value": "a"},
            {"region": "2-2", "position": {"x": 0, "y": 0}, "value": "b"}
        ]}})
        .to_string();
        room.handle_message(a.id(), &payload).await;

        let frames = a.drain();
        assert_eq!(frames[0]["data"]["error"], "not subscribed to region 2-2");
        assert!(b.drain().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn erasing_last_cell_deletes_region() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let a = open_subscribed(&mut room, &["0-0"]).await;

        room.handle_message(a.id(), &update_msg("0-0", 0, 0, "x")).await;
        assert_eq!(store.len().await, 1);
        room.handle_message(a.id(), &update_msg("0-0", 0, 0, " ")).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn stale_recipient_is_dropped_without_failing_sender() {
        let mut room = room_with(MemoryRegionStore::new());
        let mut a = open_subscribed(&mut room, &["1-1"]).await;
        let b = open_subscribed(&mut room, &["1-1"]).await;
        let b_id = b.id();
        drop(b);

        room.handle_message(a.id(), &update_msg("1-1", 0, 0, "q")).await;

        assert!(a.drain().is_empty());
        assert_eq!(room.connection_count(), 1);
        assert_eq!(room.subscribers(&key(1, 1)), &[a.id()]);
        assert!(room.subscriptions(&b_id).is_empty());
        assert!(room.is_consistent());
    }

    #[tokio::test]
    async fn close_purges_index_and_cache() {
        let mut room = room_with(MemoryRegionStore::new());
        let a = open_subscribed(&mut room, &["1-1", "2-2"]).await;
        let b = open_subscribed(&mut room, &["1-1"]).await;
        room.handle_message(a.id(), &update_msg("2-2", 0, 0, "q")).await;
        assert!(room.is_region_cached(&key(2, 2)));

        assert!(room.close(&a.id()));
        assert_eq!(room.subscribers(&key(1, 1)), &[b.id()]);
        assert!(!room.index_snapshot().contains_key(&key(2, 2)));
        assert!(!room.is_region_cached(&key(2, 2)));
        assert!(!room.close(&a.id()));
    }

    #[tokio::test]
    async fn unsubscribe_updates_index_and_attachment() {
        let mut room = room_with(MemoryRegionStore::new());
        let mut a = open_subscribed(&mut room, &["0-0", "0-1", "0-2"]).await;

        let payload =
            json!({"type": "unsubscribe", "data": {"regions": ["0-1", "9-9"]}}).to_string();
        room.handle_message(a.id(), &payload).await;

        let frames = a.drain();
        assert_eq!(
            frames[0]["data"],
            json!({"subscribedRegions": ["0-0", "0-2"], "unsubscribedRegions": ["0-1"]})
        );
        assert!(!room.index_snapshot().contains_key(&key(0, 1)));
        assert_eq!(
            decode_attachment(a.handle.attachment().load().as_deref(), MAX).unwrap(),
            vec![key(0, 0), key(0, 2)]
        );
    }

    #[tokio::test]
    async fn load_reads_without_subscribing() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let mut cells = blank_cells();
        cells[10] = '#';
        RegionBridge::new(store.clone(), "lobby")
            .save(&key(5, 5), &cells.iter().collect::<String>())
            .await
            .unwrap();

        let mut a = Client::new();
        room.open(a.handle.clone());
        let payload = json!({"type": "load", "data": {"regions": ["5-5", "6-6"]}}).to_string();
        room.handle_message(a.id(), &payload).await;

        let frames = a.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "regionData");
        assert!(frames[0]["data"]["regions"]["5-5"].is_string());
        assert_eq!(frames[0]["data"]["regions"]["6-6"], Value::Null);
        assert!(room.subscriptions(&a.id()).is_empty());
        assert_eq!(room.active_region_count(), 0);
    }

    #[tokio::test]
    async fn revival_restores_index_from_attachments() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let a = open_subscribed(&mut room, &["1-1"]).await;
        let b = open_subscribed(&mut room, &["1-1", "2-2"]).await;
        let before = room.index_snapshot();
        drop(room);

        let revived = Room::revive(
            identity(),
            RegionBridge::new(store, "lobby"),
            MAX,
            [a.handle.clone(), b.handle.clone()],
        );
        assert_eq!(revived.index_snapshot(), before);
        assert_eq!(revived.subscriptions(&a.id()), &[key(1, 1)]);
        assert_eq!(revived.subscriptions(&b.id()), &[key(1, 1), key(2, 2)]);
        assert!(revived.is_consistent());
    }

    #[tokio::test]
    async fn revival_tolerates_corrupt_attachment() {
        let store = MemoryRegionStore::new();
        let good = Client::new();
        good.handle
            .attachment()
            .store(encode_attachment(&[key(3, 3)]).unwrap());
        let broken = Client::new();
        broken.handle.attachment().store("{oops".into());
        let missing = Client::new();

        let room = Room::revive(
            identity(),
            RegionBridge::new(store, "lobby"),
            MAX,
            [
                good.handle.clone(),
                broken.handle.clone(),
                missing.handle.clone(),
            ],
        );
        assert_eq!(room.connection_count(), 3);
        assert_eq!(room.subscriptions(&good.id()), &[key(3, 3)]);
        assert!(room.subscriptions(&broken.id()).is_empty());
        assert!(room.subscriptions(&missing.id()).is_empty());
        assert_eq!(room.subscribers(&key(3, 3)), &[good.id()]);
    }

    #[tokio::test]
    async fn revived_room_keeps_broadcasting() {
        let store = MemoryRegionStore::new();
        let mut room = room_with(store.clone());
        let mut a = open_subscribed(&mut room, &["1-1"]).await;
        let mut b = open_subscribed(&mut room, &["1-1"]).await;
        room.handle_message(a.id(), &update_msg("1-1", 1, 0, "x")).await;
        b.drain();
        drop(room);

        let mut room = Room::revive(
            identity(),
            RegionBridge::new(store, "lobby"),
            MAX,
            [a.handle.clone(), b.handle.clone()],
        );
        room.handle_message(b.id(), &update_msg("1-1", 2, 0, "y")).await;
        assert_eq!(a.drain().len(), 1);

        let mut c = Client::new();
        room.open(c.handle.clone());
        room.handle_message(c.id(), &subscribe_msg(&["1-1"])).await;
        let frames = c.drain();
        let content = frames[1]["data"]["regions"]["1-1"].as_str().unwrap();
        assert!(content.starts_with(" xy"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize, Vec<(i32, i32)>),
        Unsubscribe(usize, Vec<(i32, i32)>),
        Update(usize, (i32, i32)),
        Reconnect(usize),
        Hibernate,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let region = (0i32..4, 0i32..3);
        prop_oneof![
            (0usize..3, prop::collection::vec(region.clone(), 1..=MAX)).prop_map(|(c, r)| Op::Subscribe(c, r)),
            (0usize..3, prop::collection::vec(region.clone(), 1..6)).prop_map(|(c, r)| Op::Unsubscribe(c, r)),
            (0usize..3, region).prop_map(|(c, r)| Op::Update(c, r)),
            (0usize..3).prop_map(Op::Reconnect),
            Just(Op::Hibernate),
        ]
    }

    fn to_strings(regions: &[(i32, i32)]) -> Vec<String> {
        regions.iter().map(|(c, r)| key(*c, *r).to_string()).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: any interleaving of commands, reconnects and
        /// hibernation keeps lists bounded and the index in agreement.
        #[test]
        fn prop_index_matches_subscriptions(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = MemoryRegionStore::new();
                let mut room = room_with(store.clone());
                let mut clients: Vec<Client> = (0..3).map(|_| Client::new()).collect();
                for client in &clients {
                    room.open(client.handle.clone());
                }

                for op in ops {
                    match op {
                        Op::Subscribe(c, regions) => {
                            let payload = json!({"type": "subscribe", "data": {"regions": to_strings(&regions)}});
                            room.handle_message(clients[c].id(), &payload.to_string()).await;
                        }
                        Op::Unsubscribe(c, regions) => {
                            let payload = json!({"type": "unsubscribe", "data": {"regions": to_strings(&regions)}});
                            room.handle_message(clients[c].id(), &payload.to_string()).await;
                        }
                        Op::Update(c, (col, row)) => {
                            let region = key(col, row).to_string();
                            room.handle_message(clients[c].id(), &update_msg(&region, 0, 0, "u")).await;
                        }
                        Op::Reconnect(c) => {
                            room.close(&clients[c].id());
                            clients[c] = Client::new();
                            room.open(clients[c].handle.clone());
                        }
                        Op::Hibernate => {
                            let before = room.index_snapshot();
                            room = Room::revive(
                                identity(),
                                RegionBridge::new(store.clone(), "lobby"),
                                MAX,
                                clients.iter().map(|client| client.handle.clone()),
                            );
                            assert_eq!(room.index_snapshot(), before);
                        }
                    }
                    assert!(room.is_consistent());
                    for client in &mut clients {
                        client.drain();
                        assert!(room.subscriptions(&client.id()).len() <= MAX);
                    }
                }
            });
        }
    }
}
