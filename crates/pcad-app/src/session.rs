//! In-process editing session
//!
//! A frontend replica and a kernel-side replica share one document over an
//! in-memory channel. Edits travel as JSON-encoded [`DocumentEdit`]s inside
//! log operations, each stamped with a Lamport clock; the kernel side
//! replays them in causal order into a snapshot and builds every object
//! through the shape cache.

use std::sync::Arc;

use futures::executor::block_on;
use parking_lot::Mutex;
use pcad_cad::{CadKernel, Solid};
use pcad_core::{
    CacheError, CacheStats, DocumentEdit, DocumentObject, DocumentSnapshot, KernelBuilder,
    OperatorKind, ShapeCache, args,
};
use pcad_sync::{
    Awareness, CommTransport, KernelWidgetRegistry, LogDocument, MemoryChannel, ProtocolError,
    RegistryError, SharedDocument,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::AppConfig;

pub const PROCESS_ID: &str = "kernel-1";
pub const CHANNEL_ID: &str = "model";

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to encode edit: {0}")]
    Encode(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An edit as stored in one log operation
///
/// `lamport` is greater than the stamp of every edit its author had seen,
/// so sorting by `(lamport, client, clock)` puts each edit after the edits
/// it was made on top of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EditRecord {
    lamport: u64,
    edit: DocumentEdit,
}

/// Decoded edits of a replica, in log order
fn records(doc: &LogDocument) -> impl Iterator<Item = (u64, u64, EditRecord)> + '_ {
    doc.entries().filter_map(|entry| {
        match serde_json::from_slice::<EditRecord>(entry.payload) {
            Ok(record) => Some((entry.client, entry.clock, record)),
            Err(e) => {
                tracing::warn!("Skipping undecodable edit {}:{}: {}", entry.client, entry.clock, e);
                None
            }
        }
    })
}

/// Append an edit to a replica, returning its Lamport stamp
pub fn publish(
    doc: &SharedDocument<LogDocument>,
    edit: &DocumentEdit,
) -> Result<u64, SessionError> {
    let mut doc = doc.lock();
    let lamport = records(&doc)
        .map(|(_, _, record)| record.lamport + 1)
        .max()
        .unwrap_or(0);
    let record = EditRecord {
        lamport,
        edit: edit.clone(),
    };
    let payload = serde_json::to_vec(&record).map_err(|e| SessionError::Encode(e.to_string()))?;
    doc.push(payload);
    Ok(lamport)
}

/// Rebuild a snapshot from every edit a replica holds
///
/// Edits are applied in causal order, ties broken by author. Edits that
/// cannot be decoded or applied are logged and skipped.
pub fn replay(doc: &LogDocument) -> DocumentSnapshot {
    let mut ordered: Vec<_> = records(doc).collect();
    ordered.sort_by_key(|(client, clock, record)| (record.lamport, *client, *clock));

    let mut snapshot = DocumentSnapshot::new();
    for (client, clock, record) in ordered {
        if let Err(e) = snapshot.apply_edit(record.edit) {
            tracing::warn!("Edit {}:{} not applied: {}", client, clock, e);
        }
    }
    snapshot
}

/// Two boxes and the cut of one by the other
pub fn sample_document() -> DocumentSnapshot {
    [
        DocumentObject::new(
            "Box1",
            OperatorKind::Box,
            args([("Length", 10.0), ("Width", 10.0), ("Height", 10.0)]),
        ),
        DocumentObject::new(
            "Box2",
            OperatorKind::Box,
            args([("Length", 5.0), ("Width", 5.0), ("Height", 5.0)]),
        ),
        DocumentObject::new(
            "Cut1",
            OperatorKind::Cut,
            args([("Base", "Box1"), ("Tool", "Box2")]),
        ),
    ]
    .into_iter()
    .collect()
}

/// Outcome of building every object of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub built: usize,
    pub declined: usize,
    pub stats: CacheStats,
}

/// Frontend and kernel replicas joined by one channel
pub struct Session {
    registry: KernelWidgetRegistry<LogDocument>,
    kernel_end: MemoryChannel,
    frontend_end: MemoryChannel,
    frontend: CommTransport<LogDocument>,
    frontend_doc: SharedDocument<LogDocument>,
    kernel_doc: SharedDocument<LogDocument>,
    cache: ShapeCache<Solid>,
}

impl Session {
    pub fn open(config: &AppConfig) -> Result<Self, SessionError> {
        let registry =
            KernelWidgetRegistry::<LogDocument>::default().with_config(config.sync.clone());
        registry.register_process(PROCESS_ID);

        let (kernel_end, frontend_end) = MemoryChannel::pair();
        let kernel_doc = block_on(registry.open_channel(
            PROCESS_ID,
            CHANNEL_ID,
            Arc::new(kernel_end.clone()),
            None,
        ))?;

        let frontend_doc = Arc::new(Mutex::new(LogDocument::default()));
        let client_id = frontend_doc.lock().client_id();
        let mut awareness = Awareness::new(client_id);
        awareness.set_local_field("user", json!({ "username": "frontend" }));
        let frontend = CommTransport::new(
            frontend_doc.clone(),
            Arc::new(Mutex::new(awareness)),
            Arc::new(frontend_end.clone()),
        )
        .with_max_message_size(config.sync.max_message_size);
        frontend.broadcast_awareness()?;

        Ok(Self {
            registry,
            kernel_end,
            frontend_end,
            frontend,
            frontend_doc,
            kernel_doc,
            cache: ShapeCache::with_config(config.cache.clone()),
        })
    }

    /// Publish an edit on the frontend replica
    pub fn edit(&self, edit: &DocumentEdit) -> Result<(), SessionError> {
        publish(&self.frontend_doc, edit).map(|_| ())
    }

    /// Deliver queued messages both ways until the channel is quiet
    pub fn pump(&mut self) -> Result<usize, SessionError> {
        let mut delivered = 0;
        loop {
            let to_kernel = self.kernel_end.drain();
            let to_frontend = self.frontend_end.drain();
            if to_kernel.is_empty() && to_frontend.is_empty() {
                return Ok(delivered);
            }
            delivered += to_kernel.len() + to_frontend.len();
            for message in to_kernel {
                self.registry.dispatch(PROCESS_ID, CHANNEL_ID, &message)?;
            }
            for message in to_frontend {
                self.frontend.receive(&message)?;
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        self.frontend.is_synced()
            && self
                .registry
                .get_transport(PROCESS_ID, CHANNEL_ID)
                .is_some_and(|transport| transport.lock().is_synced())
    }

    pub fn frontend_snapshot(&self) -> DocumentSnapshot {
        replay(&self.frontend_doc.lock())
    }

    pub fn kernel_snapshot(&self) -> DocumentSnapshot {
        replay(&self.kernel_doc.lock())
    }

    /// Users the kernel side can see
    pub fn kernel_peers(&self) -> Vec<serde_json::Value> {
        self.registry
            .get_transport(PROCESS_ID, CHANNEL_ID)
            .map(|transport| {
                let shared = transport.lock().awareness().clone();
                let awareness = shared.lock();
                awareness
                    .states()
                    .iter()
                    .filter(|(client, _)| **client != awareness.client_id())
                    .filter_map(|(_, state)| state.get("user").cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build every object of the kernel snapshot through the cache
    pub fn rebuild(&self, kernel: &dyn CadKernel) -> Result<BuildReport, CacheError> {
        let snapshot = self.kernel_snapshot();
        let builder = KernelBuilder::new(kernel, &self.cache);

        let mut report = BuildReport::default();
        for object in snapshot.iter() {
            match self.cache.get_or_build_object(&object.name, &snapshot, &builder)? {
                Some(_) => report.built += 1,
                None => report.declined += 1,
            }
        }
        report.stats = self.cache.stats();
        Ok(report)
    }

    /// Dispose both transports
    pub fn close(mut self) {
        self.frontend.dispose();
        self.registry.unregister_process(PROCESS_ID);
    }
}
