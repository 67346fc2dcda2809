use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Small blob kept by the transport next to an open socket. It outlives the
/// room's in-memory state, so the room writes what it needs to rebuild a
/// connection after hibernating.
#[derive(Debug, Clone, Default)]
pub struct AttachmentSlot(Arc<Mutex<Option<String>>>);

impl AttachmentSlot {
    pub fn store(&self, value: String) {
        *self.0.lock() = Some(value);
    }

    pub fn load(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

/// Transport-side view of one open socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    attachment: AttachmentSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl ConnectionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
            attachment: AttachmentSlot::default(),
        }
    }

    /// Queue a text frame for the socket writer.
    pub fn send(&self, frame: String) -> Result<(), Disconnected> {
        self.outbound.send(frame).map_err(|_| Disconnected)
    }

    pub fn attachment(&self) -> &AttachmentSlot {
        &self.attachment
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
