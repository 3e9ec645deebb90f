//! Tunnel registry — identifier → live device channel.
//!
//! Each device connection is represented by a cloneable [`DeviceChannel`]
//! handle. The registry holds at most one handle per identifier; the last
//! registration wins. All operations take a synchronous lock and never hold
//! it across an `.await`, so a lookup and its matching update are always
//! observed atomically by concurrent handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use super::envelope::ResponseEnvelope;

/// Pending correlations on a single channel, keyed by request id.
///
/// Presence in the table is the `active` flag: whoever removes an entry
/// owns the right to resolve it.
pub type PendingTable = Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one physical device connection.
///
/// Cloning is cheap; all clones refer to the same connection. Two handles
/// are equal when they refer to the same connection.
#[derive(Clone)]
pub struct DeviceChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    /// Process-unique connection number, used for identity and logging.
    conn_id: u64,
    /// Outbound text frames, drained by the connection's writer task.
    outbound: mpsc::Sender<String>,
    open: AtomicBool,
    pending: PendingTable,
}

impl DeviceChannel {
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                conn_id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                open: AtomicBool::new(true),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Whether the connection can still carry frames.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire) && !self.inner.outbound.is_closed()
    }

    /// Mark the connection closed. Subsequent sends fail fast.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
    }

    /// Queue a text frame for the device. Fails if the connection is gone.
    pub async fn send(&self, frame: String) -> Result<(), mpsc::error::SendError<String>> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(mpsc::error::SendError(frame));
        }
        self.inner.outbound.send(frame).await
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    /// Number of requests currently awaiting a response on this channel.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl PartialEq for DeviceChannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceChannel {}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("conn_id", &self.inner.conn_id)
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Identifier → channel map shared by every handler.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, DeviceChannel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under `identifier`, replacing any existing entry.
    /// Returns the replaced channel, if it was a different connection.
    pub fn put(&self, identifier: &str, channel: DeviceChannel) -> Option<DeviceChannel> {
        let mut tunnels = self.tunnels.write();
        let previous = tunnels.insert(identifier.to_string(), channel.clone());
        previous.filter(|old| *old != channel)
    }

    pub fn get(&self, identifier: &str) -> Option<DeviceChannel> {
        self.tunnels.read().get(identifier).cloned()
    }

    /// Remove `identifier` only if it still maps to `channel`.
    ///
    /// A stale connection closing after a fresh registration must not evict
    /// the newer entry. Returns whether an entry was removed.
    pub fn remove(&self, identifier: &str, channel: &DeviceChannel) -> bool {
        let mut tunnels = self.tunnels.write();
        if tunnels.get(identifier) == Some(channel) {
            tunnels.remove(identifier);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.read().is_empty()
    }

    /// Registered identifiers in lexical order.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tunnels.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}
