//! Replicated document seam
//!
//! The sync protocol treats document state as opaque bytes. [`SyncDocument`]
//! is everything it needs from a CRDT: a state vector, a diff against a
//! peer's state vector, update application and update notification.
//! [`LogDocument`] is a small grow-only replica implementing it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{CodecError, Decoder, Encoder};

/// Document errors
#[derive(Debug, Clone, Error)]
pub enum DocError {
    #[error("Malformed update: {0}")]
    Codec(#[from] CodecError),
    #[error("Rejected update: {0}")]
    Rejected(String),
}

/// Who produced an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Edited on this replica
    Local,
    /// Received through the transport with this id
    Remote(Uuid),
}

/// Handle returned by [`SyncDocument::subscribe`]
pub type SubscriptionId = u64;

/// Callback invoked with every update applied to a document
pub type UpdateListener = Box<dyn FnMut(&[u8], &UpdateOrigin) + Send>;

/// A document shared between the transports of one channel
pub type SharedDocument<D> = Arc<Mutex<D>>;

/// A replicated document that can be synchronized over a byte channel
pub trait SyncDocument: Send {
    /// Encoded summary of everything this replica has seen
    fn state_vector(&self) -> Vec<u8>;

    /// Update carrying everything missing from a peer with `state_vector`
    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError>;

    /// Merge a remote or local update
    ///
    /// Listeners are notified with the part of the update that was new.
    fn apply_update(&mut self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError>;

    fn subscribe(&mut self, listener: UpdateListener) -> SubscriptionId;

    /// Returns false if the subscription was not found
    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;
}

// ============== Grow-only log ==============

/// One operation of a [`LogDocument`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<'a> {
    pub client: u64,
    pub clock: u64,
    pub payload: &'a [u8],
}

/// Grow-only set of `(client, clock) -> payload` operations
///
/// The state vector holds, per client, the length of the contiguous run of
/// clocks starting at zero. Operations never change once written, so merging
/// is a set union and replicas that saw the same operations agree on
/// [`LogDocument::entries`].
pub struct LogDocument {
    client_id: u64,
    ops: BTreeMap<(u64, u64), Vec<u8>>,
    clocks: BTreeMap<u64, u64>,
    listeners: Vec<(SubscriptionId, UpdateListener)>,
    next_subscription: SubscriptionId,
}

impl Default for LogDocument {
    fn default() -> Self {
        Self::new(Uuid::new_v4().as_u64_pair().0)
    }
}

impl std::fmt::Debug for LogDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDocument")
            .field("client_id", &self.client_id)
            .field("ops", &self.ops.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn encode_ops<'a>(ops: impl ExactSizeIterator<Item = (&'a (u64, u64), &'a Vec<u8>)>) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_uint(ops.len() as u64);
    for ((client, clock), payload) in ops {
        encoder.write_var_uint(*client);
        encoder.write_var_uint(*clock);
        encoder.write_var_bytes(payload);
    }
    encoder.into_bytes()
}

fn decode_state_vector(bytes: &[u8]) -> Result<BTreeMap<u64, u64>, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_var_uint()?;
    let mut clocks = BTreeMap::new();
    for _ in 0..count {
        let client = decoder.read_var_uint()?;
        let clock = decoder.read_var_uint()?;
        clocks.insert(client, clock);
    }
    Ok(clocks)
}

impl LogDocument {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            ops: BTreeMap::new(),
            clocks: BTreeMap::new(),
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append a local operation and notify listeners
    ///
    /// Returns the `(client, clock)` the operation was written under.
    pub fn push(&mut self, payload: impl Into<Vec<u8>>) -> (u64, u64) {
        let id = (self.client_id, self.clock_of(self.client_id));
        self.insert(id, payload.into());
        let update = encode_ops(self.ops.get_key_value(&id).into_iter());
        self.notify(&update, &UpdateOrigin::Local);
        id
    }

    /// All operations ordered by `(client, clock)`
    pub fn entries(&self) -> impl Iterator<Item = LogEntry<'_>> {
        self.ops.iter().map(|((client, clock), payload)| LogEntry {
            client: *client,
            clock: *clock,
            payload,
        })
    }

    /// Contiguous clock of a client
    pub fn clock_of(&self, client: u64) -> u64 {
        self.clocks.get(&client).copied().unwrap_or(0)
    }

    fn insert(&mut self, id: (u64, u64), payload: Vec<u8>) -> bool {
        if self.ops.contains_key(&id) {
            return false;
        }
        self.ops.insert(id, payload);

        let (client, _) = id;
        let mut clock = self.clock_of(client);
        while self.ops.contains_key(&(client, clock)) {
            clock += 1;
        }
        self.clocks.insert(client, clock);
        true
    }

    fn notify(&mut self, update: &[u8], origin: &UpdateOrigin) {
        for (_, listener) in &mut self.listeners {
            listener(update, origin);
        }
    }
}

impl SyncDocument for LogDocument {
    fn state_vector(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_uint(self.clocks.len() as u64);
        for (client, clock) in &self.clocks {
            encoder.write_var_uint(*client);
            encoder.write_var_uint(*clock);
        }
        encoder.into_bytes()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let known = decode_state_vector(state_vector)?;
        let missing: Vec<_> = self
            .ops
            .iter()
            .filter(|((client, clock), _)| *clock >= known.get(client).copied().unwrap_or(0))
            .collect();
        Ok(encode_ops(missing.into_iter()))
    }

    fn apply_update(&mut self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError> {
        // Decode fully before touching state so a bad update changes nothing
        let mut decoder = Decoder::new(update);
        let count = decoder.read_var_uint()?;
        let mut incoming = Vec::new();
        for _ in 0..count {
            let client = decoder.read_var_uint()?;
            let clock = decoder.read_var_uint()?;
            let payload = decoder.read_var_bytes()?;
            incoming.push(((client, clock), payload.to_vec()));
        }

        let mut fresh = BTreeMap::new();
        for (id, payload) in incoming {
            if self.insert(id, payload.clone()) {
                fresh.insert(id, payload);
            }
        }

        if !fresh.is_empty() {
            tracing::debug!("Applied {} new operations ({:?})", fresh.len(), origin);
            let update = encode_ops(fresh.iter());
            self.notify(&update, &origin);
        }
        Ok(())
    }

    fn subscribe(&mut self, listener: UpdateListener) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.push((id, listener));
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(doc: &LogDocument) -> Vec<Vec<u8>> {
        doc.entries().map(|e| e.payload.to_vec()).collect()
    }

    #[test]
    fn test_push_advances_local_clock() {
        let mut doc = LogDocument::new(1);
        assert_eq!(doc.push(b"a".to_vec()), (1, 0));
        assert_eq!(doc.push(b"b".to_vec()), (1, 1));
        assert_eq!(doc.clock_of(1), 2);
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_diff_carries_only_missing_ops() {
        let mut a = LogDocument::new(1);
        let mut b = LogDocument::new(2);
        a.push(b"one".to_vec());
        b.apply_update(&a.diff_since(&b.state_vector()).unwrap(), UpdateOrigin::Local)
            .unwrap();
        a.push(b"two".to_vec());

        let diff = a.diff_since(&b.state_vector()).unwrap();
        let mut decoder = Decoder::new(&diff);
        assert_eq!(decoder.read_var_uint().unwrap(), 1);

        b.apply_update(&diff, UpdateOrigin::Local).unwrap();
        assert_eq!(payloads(&b), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_replicas_converge_regardless_of_order() {
        let mut a = LogDocument::new(1);
        let mut b = LogDocument::new(2);
        a.push(b"a0".to_vec());
        b.push(b"b0".to_vec());
        a.push(b"a1".to_vec());

        let to_b = a.diff_since(&b.state_vector()).unwrap();
        let to_a = b.diff_since(&a.state_vector()).unwrap();
        b.apply_update(&to_b, UpdateOrigin::Local).unwrap();
        a.apply_update(&to_a, UpdateOrigin::Local).unwrap();

        assert_eq!(payloads(&a), payloads(&b));
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_apply_is_idempotent_and_notifies_new_ops_only() {
        let mut source = LogDocument::new(1);
        source.push(b"x".to_vec());
        let update = source.diff_since(&LogDocument::new(9).state_vector()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut doc = LogDocument::new(2);
        let sink = seen.clone();
        doc.subscribe(Box::new(move |update, origin| {
            sink.lock().push((update.to_vec(), *origin));
        }));

        doc.apply_update(&update, UpdateOrigin::Local).unwrap();
        doc.apply_update(&update, UpdateOrigin::Local).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_gap_keeps_state_vector_contiguous() {
        let mut doc = LogDocument::new(5);
        let mut encoder = Encoder::new();
        encoder.write_var_uint(1);
        encoder.write_var_uint(7);
        encoder.write_var_uint(1);
        encoder.write_var_bytes(b"late");
        doc.apply_update(encoder.as_bytes(), UpdateOrigin::Local).unwrap();
        assert_eq!(doc.clock_of(7), 0);

        let mut encoder = Encoder::new();
        encoder.write_var_uint(1);
        encoder.write_var_uint(7);
        encoder.write_var_uint(0);
        encoder.write_var_bytes(b"early");
        doc.apply_update(encoder.as_bytes(), UpdateOrigin::Local).unwrap();
        assert_eq!(doc.clock_of(7), 2);
    }

    #[test]
    fn test_malformed_update_changes_nothing() {
        let mut doc = LogDocument::new(1);
        assert!(doc.apply_update(&[0x02, 0x01, 0x00, 0x01, b'a'], UpdateOrigin::Local).is_err());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let mut doc = LogDocument::new(1);
        let id = doc.subscribe(Box::new(|_, _| {}));
        assert!(doc.unsubscribe(id));
        assert!(!doc.unsubscribe(id));
    }
}
