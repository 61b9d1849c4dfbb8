//! Shared documents per kernel process and comm channel
//!
//! Each kernel process owns a set of channels. Opening a channel creates a
//! fresh document, binds it to the channel with a [`CommTransport`] and,
//! when the open request names a room, also connects the document to that
//! room before the channel becomes usable.
//!
//! The channel map is locked only for short synchronous steps, never while
//! waiting on a room, so a stalled room leaves every other channel usable.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::Awareness;
use crate::config::{DuplicateChannelPolicy, SyncConfig};
use crate::doc::{SharedDocument, SyncDocument};
use crate::protocol::ProtocolError;
use crate::transport::{ByteChannel, CommTransport};

/// Registry errors
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Unknown kernel process: {0}")]
    UnknownProcess(String),
    #[error("Unknown channel {channel} on process {process}")]
    UnknownChannel { process: String, channel: String },
    #[error("Channel {channel} is already open on process {process}")]
    DuplicateChannel { process: String, channel: String },
    #[error("No room connector configured for {0}")]
    NoRoomConnector(String),
    #[error("Room failed: {0}")]
    Room(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Path-addressed room a channel's document also joins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomAddress {
    pub path: String,
    pub format: String,
    pub content_type: String,
}

impl RoomAddress {
    pub fn new(
        path: impl Into<String>,
        format: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            format: format.into(),
            content_type: content_type.into(),
        }
    }
}

/// A live connection between a document and a room
pub trait RoomProvider: Send {
    /// Resolves once the room's initial state has been merged into the document
    fn ready(&mut self) -> BoxFuture<'static, RegistryResult<()>>;

    /// Disconnect from the room
    fn destroy(&mut self);
}

/// Creates room providers for channels opened with a [`RoomAddress`]
pub trait RoomConnector<D>: Send + Sync {
    fn connect(
        &self,
        address: &RoomAddress,
        doc: SharedDocument<D>,
        awareness: Arc<Mutex<Awareness>>,
    ) -> RegistryResult<Box<dyn RoomProvider>>;
}

/// Supplies the `user` awareness field of channels without a room
pub trait UserIdentityProvider: Send + Sync {
    fn identity(&self) -> Value;
}

/// Identity used when nothing better is known
#[derive(Debug, Clone)]
pub struct AnonymousIdentity {
    pub username: String,
}

impl Default for AnonymousIdentity {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
        }
    }
}

impl UserIdentityProvider for AnonymousIdentity {
    fn identity(&self) -> Value {
        json!({ "username": self.username })
    }
}

/// Transport of an open channel, shared with callers
pub type SharedTransport<D> = Arc<Mutex<CommTransport<D>>>;

struct ChannelEntry<D: SyncDocument> {
    document: SharedDocument<D>,
    transport: SharedTransport<D>,
    room: Option<Box<dyn RoomProvider>>,
}

impl<D: SyncDocument> ChannelEntry<D> {
    fn dispose(mut self) {
        self.transport.lock().dispose();
        if let Some(room) = self.room.as_mut() {
            room.destroy();
        }
    }
}

/// Destroys a room connection unless a registered channel took it over
///
/// Covers every way an open can stop early: a failed `ready`, a process
/// that went away meanwhile, or the open future being dropped mid-wait.
struct RoomGuard(Option<Box<dyn RoomProvider>>);

impl RoomGuard {
    fn disarm(mut self) -> Option<Box<dyn RoomProvider>> {
        self.0.take()
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        if let Some(room) = self.0.as_mut() {
            tracing::debug!("Destroying room of a channel that never opened");
            room.destroy();
        }
    }
}

type ChannelMap<D> = HashMap<String, HashMap<String, ChannelEntry<D>>>;

/// Documents keyed by `(process, channel)`
pub struct KernelWidgetRegistry<D: SyncDocument + Default + 'static> {
    processes: Mutex<ChannelMap<D>>,
    connector: Option<Arc<dyn RoomConnector<D>>>,
    identity: Arc<dyn UserIdentityProvider>,
    config: SyncConfig,
}

impl<D: SyncDocument + Default + 'static> Default for KernelWidgetRegistry<D> {
    fn default() -> Self {
        Self::new(Arc::new(AnonymousIdentity::default()))
    }
}

impl<D: SyncDocument + Default + 'static> KernelWidgetRegistry<D> {
    pub fn new(identity: Arc<dyn UserIdentityProvider>) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            connector: None,
            identity,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_room_connector(mut self, connector: Arc<dyn RoomConnector<D>>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns false if the process was already registered
    pub fn register_process(&self, process_id: impl Into<String>) -> bool {
        let process_id = process_id.into();
        let mut processes = self.processes.lock();
        if processes.contains_key(&process_id) {
            return false;
        }
        tracing::info!("Registered kernel process {}", process_id);
        processes.insert(process_id, HashMap::new());
        true
    }

    /// Forget a process and dispose every channel it owns
    pub fn unregister_process(&self, process_id: &str) -> bool {
        let Some(channels) = self.processes.lock().remove(process_id) else {
            return false;
        };
        let count = channels.len();
        for (_, entry) in channels {
            entry.dispose();
        }
        tracing::info!("Unregistered kernel process {} ({} channels)", process_id, count);
        true
    }

    pub fn has_process(&self, process_id: &str) -> bool {
        self.processes.lock().contains_key(process_id)
    }

    pub fn channel_count(&self, process_id: &str) -> Option<usize> {
        self.processes.lock().get(process_id).map(HashMap::len)
    }

    /// Open a channel under a registered process
    ///
    /// With an `address`, the document first joins that room and the
    /// channel is only registered once the room reports ready. Without one,
    /// the local awareness `user` field comes from the identity provider.
    /// Dropping the returned future before it completes destroys the room.
    pub async fn open_channel(
        &self,
        process_id: &str,
        channel_id: &str,
        channel: Arc<dyn ByteChannel>,
        address: Option<RoomAddress>,
    ) -> RegistryResult<SharedDocument<D>> {
        self.check_open(process_id, channel_id)?;

        let document: SharedDocument<D> = Arc::new(Mutex::new(D::default()));
        let awareness = Arc::new(Mutex::new(Awareness::new(Uuid::new_v4().as_u64_pair().0)));

        let mut room = RoomGuard(None);
        match &address {
            Some(address) => {
                let connector = self
                    .connector
                    .clone()
                    .ok_or_else(|| RegistryError::NoRoomConnector(address.path.clone()))?;
                let provider = room
                    .0
                    .insert(connector.connect(address, document.clone(), awareness.clone())?);
                provider.ready().await?;
                tracing::debug!("Room {} ready for channel {}", address.path, channel_id);
            }
            None => {
                awareness
                    .lock()
                    .set_local_field("user", self.identity.identity());
            }
        }

        self.commit(process_id, channel_id, document, awareness, channel, room)
    }

    fn duplicate_rejected(
        &self,
        channels: &HashMap<String, ChannelEntry<D>>,
        channel_id: &str,
    ) -> bool {
        channels.contains_key(channel_id)
            && self.config.duplicate_channels == DuplicateChannelPolicy::Reject
    }

    fn check_open(&self, process_id: &str, channel_id: &str) -> RegistryResult<()> {
        let processes = self.processes.lock();
        let Some(channels) = processes.get(process_id) else {
            return Err(RegistryError::UnknownProcess(process_id.to_string()));
        };
        if self.duplicate_rejected(channels, channel_id) {
            return Err(RegistryError::DuplicateChannel {
                process: process_id.to_string(),
                channel: channel_id.to_string(),
            });
        }
        Ok(())
    }

    /// Register a channel whose room (if any) is ready
    ///
    /// The process and duplicate checks run again since the map may have
    /// changed while the room was joining.
    fn commit(
        &self,
        process_id: &str,
        channel_id: &str,
        document: SharedDocument<D>,
        awareness: Arc<Mutex<Awareness>>,
        channel: Arc<dyn ByteChannel>,
        room: RoomGuard,
    ) -> RegistryResult<SharedDocument<D>> {
        let mut processes = self.processes.lock();
        let Some(channels) = processes.get_mut(process_id) else {
            return Err(RegistryError::UnknownProcess(process_id.to_string()));
        };
        if self.duplicate_rejected(channels, channel_id) {
            return Err(RegistryError::DuplicateChannel {
                process: process_id.to_string(),
                channel: channel_id.to_string(),
            });
        }

        let transport = CommTransport::new(document.clone(), awareness, channel)
            .with_max_message_size(self.config.max_message_size);
        let entry = ChannelEntry {
            document: document.clone(),
            transport: Arc::new(Mutex::new(transport)),
            room: room.disarm(),
        };
        let previous = channels.insert(channel_id.to_string(), entry);
        drop(processes);

        match previous {
            Some(previous) => {
                tracing::info!("Channel {} on {} replaced", channel_id, process_id);
                previous.dispose();
            }
            None => tracing::info!("Channel {} opened on {}", channel_id, process_id),
        }
        Ok(document)
    }

    /// Dispose one channel
    pub fn close_channel(&self, process_id: &str, channel_id: &str) -> bool {
        let removed = self
            .processes
            .lock()
            .get_mut(process_id)
            .and_then(|channels| channels.remove(channel_id));
        match removed {
            Some(entry) => {
                entry.dispose();
                tracing::info!("Channel {} closed on {}", channel_id, process_id);
                true
            }
            None => false,
        }
    }

    /// Deliver inbound bytes to a channel's transport
    ///
    /// Only the target channel's transport is locked while the bytes are
    /// handled.
    pub fn dispatch(&self, process_id: &str, channel_id: &str, bytes: &[u8]) -> RegistryResult<()> {
        let transport = self
            .get_transport(process_id, channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel {
                process: process_id.to_string(),
                channel: channel_id.to_string(),
            })?;
        transport.lock().receive(bytes)?;
        Ok(())
    }

    fn with_entry<R>(
        &self,
        process_id: &str,
        channel_id: &str,
        f: impl FnOnce(&ChannelEntry<D>) -> R,
    ) -> Option<R> {
        self.processes
            .lock()
            .get(process_id)?
            .get(channel_id)
            .map(f)
    }

    pub fn get_document(&self, process_id: &str, channel_id: &str) -> Option<SharedDocument<D>> {
        self.with_entry(process_id, channel_id, |entry| entry.document.clone())
    }

    pub fn get_transport(&self, process_id: &str, channel_id: &str) -> Option<SharedTransport<D>> {
        self.with_entry(process_id, channel_id, |entry| entry.transport.clone())
    }
}
