//! Document synchronization over a message channel
//!
//! A [`CommTransport`] binds one shared document to one [`ByteChannel`].
//! Local updates are forwarded as sync updates; inbound bytes are pushed in
//! by the channel owner through [`CommTransport::receive`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::awareness::Awareness;
use crate::doc::{SharedDocument, SubscriptionId, SyncDocument, UpdateOrigin};
use crate::protocol::{
    ProtocolError, ProtocolResult, SyncEvent, SyncMessage, SyncState, encode_sync_step1,
    encode_update, handle_message,
};

/// Outbound half of a message-oriented channel
///
/// Implementations must deliver messages in order and without loss.
pub trait ByteChannel: Send + Sync {
    fn send(&self, bytes: &[u8]);

    fn close(&self);
}

// ============== In-process channel ==============

#[derive(Debug, Default)]
struct Queue {
    messages: Mutex<VecDeque<Vec<u8>>>,
}

/// One end of an in-process channel pair
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    outgoing: Arc<Queue>,
    incoming: Arc<Queue>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Two connected ends; what one sends the other drains
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Queue::default());
        let b_to_a = Arc::new(Queue::default());
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                outgoing: a_to_b.clone(),
                incoming: b_to_a.clone(),
                closed: closed.clone(),
            },
            Self {
                outgoing: b_to_a,
                incoming: a_to_b,
                closed,
            },
        )
    }

    /// Take every message received so far, oldest first
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.incoming.messages.lock().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.incoming.messages.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ByteChannel for MemoryChannel {
    fn send(&self, bytes: &[u8]) {
        if self.is_closed() {
            tracing::debug!("Dropping {} bytes sent on closed channel", bytes.len());
            return;
        }
        self.outgoing.messages.lock().push_back(bytes.to_vec());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ============== Transport ==============

/// Keeps a shared document in sync with the peer at the other end of a channel
pub struct CommTransport<D: SyncDocument> {
    id: Uuid,
    doc: SharedDocument<D>,
    awareness: Arc<Mutex<Awareness>>,
    channel: Arc<dyn ByteChannel>,
    subscription: SubscriptionId,
    state: SyncState,
    max_message_size: Option<usize>,
    disposed: bool,
}

impl<D: SyncDocument> CommTransport<D> {
    /// Attach to `doc` and start the handshake
    ///
    /// Every document update not received through this transport is
    /// forwarded to the peer. A step 1 is sent immediately.
    pub fn new(
        doc: SharedDocument<D>,
        awareness: Arc<Mutex<Awareness>>,
        channel: Arc<dyn ByteChannel>,
    ) -> Self {
        let id = Uuid::new_v4();

        let mut guard = doc.lock();
        let forward = channel.clone();
        let subscription = guard.subscribe(Box::new(move |update: &[u8], origin: &UpdateOrigin| {
            if *origin != UpdateOrigin::Remote(id) {
                forward.send(&encode_update(update));
            }
        }));
        let step1 = encode_sync_step1(&*guard);
        drop(guard);

        channel.send(&step1);
        tracing::info!("Transport {} opened, sent sync step 1", id);

        Self {
            id,
            doc,
            awareness,
            channel,
            subscription,
            state: SyncState::Unsynced.transition(SyncEvent::Step1Sent),
            max_message_size: None,
            disposed: false,
        }
    }

    /// Drop inbound messages larger than `max` bytes
    pub fn with_max_message_size(mut self, max: Option<usize>) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn document(&self) -> &SharedDocument<D> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Mutex<Awareness>> {
        &self.awareness
    }

    /// Handle one message from the peer
    ///
    /// Messages are applied strictly in the order they are received.
    /// Failures are logged and returned; the transport stays usable.
    pub fn receive(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        if self.disposed {
            return Ok(());
        }

        if let Some(max) = self.max_message_size
            && bytes.len() > max
        {
            tracing::warn!("Transport {} dropped {} byte message", self.id, bytes.len());
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max,
            });
        }

        let outcome = {
            let mut doc = self.doc.lock();
            let mut awareness = self.awareness.lock();
            handle_message(bytes, &mut *doc, &mut awareness, UpdateOrigin::Remote(self.id))
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Transport {} ignored message: {}", self.id, e);
                return Err(e);
            }
        };

        if let Some(response) = outcome.response {
            self.channel.send(&response);
        }
        if let Some(event) = outcome.event {
            let next = self.state.transition(event);
            if next != self.state {
                tracing::debug!("Transport {} {:?} -> {:?}", self.id, self.state, next);
            }
            self.state = next;
        }
        Ok(())
    }

    /// Send the local awareness state to the peer
    pub fn broadcast_awareness(&self) -> ProtocolResult<()> {
        if self.disposed {
            return Ok(());
        }
        let update = self.awareness.lock().encode_local_update()?;
        self.channel.send(&SyncMessage::Awareness(update).encode());
        Ok(())
    }

    /// Detach from the document and close the channel
    ///
    /// Calling it again does nothing. Updates already applied stay applied.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.doc.lock().unsubscribe(self.subscription);
        self.channel.close();
        tracing::info!("Transport {} disposed", self.id);
    }
}

impl<D: SyncDocument> Drop for CommTransport<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::doc::LogDocument;
    use crate::protocol::SyncStep;

    struct Peer {
        doc: SharedDocument<LogDocument>,
        end: MemoryChannel,
        transport: CommTransport<LogDocument>,
    }

    fn peer(client: u64, end: MemoryChannel) -> Peer {
        let doc = Arc::new(Mutex::new(LogDocument::new(client)));
        let awareness = Arc::new(Mutex::new(Awareness::new(client)));
        let transport = CommTransport::new(doc.clone(), awareness, Arc::new(end.clone()));
        Peer { doc, end, transport }
    }

    /// Deliver messages both ways until both queues are empty
    fn pump(a: &mut Peer, b: &mut Peer) -> usize {
        let mut delivered = 0;
        loop {
            let to_a = a.end.drain();
            let to_b = b.end.drain();
            if to_a.is_empty() && to_b.is_empty() {
                return delivered;
            }
            delivered += to_a.len() + to_b.len();
            for message in to_a {
                a.transport.receive(&message).unwrap();
            }
            for message in to_b {
                b.transport.receive(&message).unwrap();
            }
        }
    }

    fn payloads(doc: &SharedDocument<LogDocument>) -> Vec<Vec<u8>> {
        doc.lock().entries().map(|e| e.payload.to_vec()).collect()
    }

    #[test]
    fn test_new_transport_sends_step1_first() {
        let (a, b) = MemoryChannel::pair();
        let left = peer(1, a);
        assert_eq!(left.transport.state(), SyncState::AwaitingStep2);

        let sent = b.drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            SyncMessage::decode(&sent[0]).unwrap(),
            SyncMessage::Sync(SyncStep::Step1(_))
        ));
    }

    #[test]
    fn test_handshake_terminates_and_converges() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        left.doc.lock().push(b"Box1".to_vec());
        let mut right = peer(2, b);
        right.doc.lock().push(b"Box2".to_vec());

        // Two step 1s and two step 2s, then two updates forwarded from the pushes
        assert!(pump(&mut left, &mut right) <= 6);
        assert!(left.transport.is_synced());
        assert!(right.transport.is_synced());
        assert_eq!(payloads(&left.doc), payloads(&right.doc));
        assert_eq!(pump(&mut left, &mut right), 0);
    }

    /// Payloads carried by one document update
    fn update_payloads(update: &[u8]) -> Vec<Vec<u8>> {
        let mut decoder = Decoder::new(update);
        let count = decoder.read_var_uint().unwrap();
        (0..count)
            .map(|_| {
                decoder.read_var_uint().unwrap();
                decoder.read_var_uint().unwrap();
                decoder.read_var_bytes().unwrap().to_vec()
            })
            .collect()
    }

    #[test]
    fn test_updates_apply_in_send_order() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        let mut right = peer(2, b);
        pump(&mut left, &mut right);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        right.doc.lock().subscribe(Box::new(move |update: &[u8], origin: &UpdateOrigin| {
            sink.lock().push((update_payloads(update), *origin));
        }));

        // A large update between small ones
        let sent: Vec<Vec<u8>> = [3usize, 4096, 1, 700, 2]
            .iter()
            .enumerate()
            .map(|(i, len)| vec![i as u8; *len])
            .collect();
        for payload in &sent {
            left.doc.lock().push(payload.clone());
        }
        assert_eq!(right.end.pending(), sent.len());
        pump(&mut left, &mut right);

        let seen = seen.lock();
        let applied: Vec<Vec<u8>> = seen
            .iter()
            .flat_map(|(payloads, _)| payloads.iter().cloned())
            .collect();
        assert_eq!(applied, sent);
        assert!(seen.iter().all(|(payloads, _)| payloads.len() == 1));
        assert!(
            seen.iter()
                .all(|(_, origin)| *origin == UpdateOrigin::Remote(right.transport.id()))
        );
    }

    #[test]
    fn test_remote_updates_are_not_echoed() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        let mut right = peer(2, b);
        pump(&mut left, &mut right);

        left.doc.lock().push(b"x".to_vec());
        for message in right.end.drain() {
            right.transport.receive(&message).unwrap();
        }
        assert_eq!(left.end.pending(), 0);
    }

    #[test]
    fn test_unknown_message_is_ignored() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        b.drain();

        assert!(matches!(
            left.transport.receive(&[42, 0]),
            Err(ProtocolError::UnknownMessageType(42))
        ));
        assert_eq!(left.transport.state(), SyncState::AwaitingStep2);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn test_oversized_message_is_dropped() {
        let (a, _b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        left.transport.max_message_size = Some(4);
        let update = encode_update(&[0; 16]);
        assert!(matches!(
            left.transport.receive(&update),
            Err(ProtocolError::MessageTooLarge { max: 4, .. })
        ));
    }

    #[test]
    fn test_awareness_reaches_peer() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        let mut right = peer(2, b);
        left.transport
            .awareness()
            .lock()
            .set_local_field("selected", serde_json::json!("Box1"));
        left.transport.broadcast_awareness().unwrap();
        pump(&mut left, &mut right);

        let states = right.transport.awareness().lock().states().clone();
        assert_eq!(states[&1], serde_json::json!({"selected": "Box1"}));
    }

    #[test]
    fn test_dispose_is_idempotent_and_final() {
        let (a, b) = MemoryChannel::pair();
        let mut left = peer(1, a);
        b.drain();

        left.transport.dispose();
        left.transport.dispose();
        assert!(left.transport.is_disposed());
        assert!(left.end.is_closed());

        left.doc.lock().push(b"late".to_vec());
        left.transport.broadcast_awareness().unwrap();
        assert!(left.transport.receive(&[42]).is_ok());
        assert_eq!(b.pending(), 0);
        assert_eq!(left.doc.lock().len(), 1);
    }
}
