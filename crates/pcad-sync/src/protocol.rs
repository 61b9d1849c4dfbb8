//! Sync and awareness message framing
//!
//! Every message starts with a varint tag. Sync messages carry a second
//! varint naming the step, followed by a length-prefixed payload that only
//! the document understands:
//!
//! ```text
//! [MESSAGE_SYNC][SYNC_STEP1][var_bytes(state vector)]
//! [MESSAGE_SYNC][SYNC_STEP2][var_bytes(update)]
//! [MESSAGE_SYNC][SYNC_UPDATE][var_bytes(update)]
//! [MESSAGE_AWARENESS][var_bytes(awareness update)]
//! ```

use thiserror::Error;

use crate::awareness::{Awareness, AwarenessError};
use crate::codec::{CodecError, Decoder, Encoder};
use crate::doc::{DocError, SyncDocument, UpdateOrigin};

pub const MESSAGE_SYNC: u64 = 0;
pub const MESSAGE_AWARENESS: u64 = 1;

pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Protocol errors
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("Unknown sync step: {0}")]
    UnknownSyncStep(u64),
    #[error("Message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============== Messages ==============

/// Step of the sync sub-protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// Sender's state vector, asks for what it is missing
    Step1(Vec<u8>),
    /// Reply to a step 1 with the missing update
    Step2(Vec<u8>),
    /// Incremental update
    Update(Vec<u8>),
}

impl SyncStep {
    fn tag(&self) -> u64 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(p) | Self::Step2(p) | Self::Update(p) => p,
        }
    }

    fn read(decoder: &mut Decoder<'_>) -> ProtocolResult<Self> {
        let tag = decoder.read_var_uint()?;
        let payload = match tag {
            SYNC_STEP1 | SYNC_STEP2 | SYNC_UPDATE => decoder.read_var_bytes()?.to_vec(),
            other => return Err(ProtocolError::UnknownSyncStep(other)),
        };
        Ok(match tag {
            SYNC_STEP1 => Self::Step1(payload),
            SYNC_STEP2 => Self::Step2(payload),
            _ => Self::Update(payload),
        })
    }
}

/// A framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Sync(SyncStep),
    Awareness(Vec<u8>),
}

impl SyncMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Self::Sync(step) => {
                encoder.write_var_uint(MESSAGE_SYNC);
                encoder.write_var_uint(step.tag());
                encoder.write_var_bytes(step.payload());
            }
            Self::Awareness(update) => {
                encoder.write_var_uint(MESSAGE_AWARENESS);
                encoder.write_var_bytes(update);
            }
        }
        encoder.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut decoder = Decoder::new(bytes);
        match decoder.read_var_uint()? {
            MESSAGE_SYNC => Ok(Self::Sync(SyncStep::read(&mut decoder)?)),
            MESSAGE_AWARENESS => Ok(Self::Awareness(decoder.read_var_bytes()?.to_vec())),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

// ============== Sync steps ==============

pub fn write_sync_step1<D: SyncDocument + ?Sized>(encoder: &mut Encoder, doc: &D) {
    encoder.write_var_uint(SYNC_STEP1);
    encoder.write_var_bytes(&doc.state_vector());
}

pub fn write_sync_step2<D: SyncDocument + ?Sized>(
    encoder: &mut Encoder,
    doc: &D,
    state_vector: &[u8],
) -> ProtocolResult<()> {
    let update = doc.diff_since(state_vector)?;
    encoder.write_var_uint(SYNC_STEP2);
    encoder.write_var_bytes(&update);
    Ok(())
}

/// Complete step 1 message for `doc`
pub fn encode_sync_step1<D: SyncDocument + ?Sized>(doc: &D) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_uint(MESSAGE_SYNC);
    write_sync_step1(&mut encoder, doc);
    encoder.into_bytes()
}

/// Complete step 2 message answering a peer's `state_vector`
pub fn encode_sync_step2<D: SyncDocument + ?Sized>(
    doc: &D,
    state_vector: &[u8],
) -> ProtocolResult<Vec<u8>> {
    let mut encoder = Encoder::new();
    encoder.write_var_uint(MESSAGE_SYNC);
    write_sync_step2(&mut encoder, doc, state_vector)?;
    Ok(encoder.into_bytes())
}

/// Complete update message
pub fn encode_update(update: &[u8]) -> Vec<u8> {
    SyncMessage::Sync(SyncStep::Update(update.to_vec())).encode()
}

/// Which sync step was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Step1,
    Step2,
    Update,
}

/// Read one sync step and act on it
///
/// A step 1 writes the matching step 2 into `response`; a step 2 or an
/// update is applied to `doc` with `origin`.
pub fn read_sync_message<D: SyncDocument + ?Sized>(
    decoder: &mut Decoder<'_>,
    response: &mut Encoder,
    doc: &mut D,
    origin: UpdateOrigin,
) -> ProtocolResult<StepKind> {
    match SyncStep::read(decoder)? {
        SyncStep::Step1(state_vector) => {
            write_sync_step2(response, doc, &state_vector)?;
            Ok(StepKind::Step1)
        }
        SyncStep::Step2(update) => {
            doc.apply_update(&update, origin)?;
            Ok(StepKind::Step2)
        }
        SyncStep::Update(update) => {
            doc.apply_update(&update, origin)?;
            Ok(StepKind::Update)
        }
    }
}

// ============== Handshake state ==============

/// Handshake progress of one channel
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    #[default]
    Unsynced,
    AwaitingStep2,
    Synced,
}

/// Handshake input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Our step 1 went out
    Step1Sent,
    /// The peer answered with a step 2
    Step2Received,
}

impl SyncState {
    pub fn transition(self, event: SyncEvent) -> Self {
        match (self, event) {
            (Self::Synced, _) => Self::Synced,
            (_, SyncEvent::Step2Received) => Self::Synced,
            (Self::Unsynced, SyncEvent::Step1Sent) => Self::AwaitingStep2,
            (Self::AwaitingStep2, SyncEvent::Step1Sent) => Self::AwaitingStep2,
        }
    }
}

/// What handling one inbound message produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOutcome {
    /// Bytes to send back, if the response holds more than its tag
    pub response: Option<Vec<u8>>,
    /// Handshake event to feed into [`SyncState::transition`]
    pub event: Option<SyncEvent>,
}

/// Decode one inbound message and apply it
///
/// An unknown tag is returned as [`ProtocolError::UnknownMessageType`]
/// before anything is touched.
pub fn handle_message<D: SyncDocument + ?Sized>(
    bytes: &[u8],
    doc: &mut D,
    awareness: &mut Awareness,
    origin: UpdateOrigin,
) -> ProtocolResult<MessageOutcome> {
    let mut decoder = Decoder::new(bytes);
    let mut response = Encoder::new();
    let mut outcome = MessageOutcome::default();

    match decoder.read_var_uint()? {
        MESSAGE_SYNC => {
            response.write_var_uint(MESSAGE_SYNC);
            let tag_len = response.len();
            let step = read_sync_message(&mut decoder, &mut response, doc, origin)?;
            tracing::debug!("Handled sync {:?} from {:?}", step, origin);
            if step == StepKind::Step2 {
                outcome.event = Some(SyncEvent::Step2Received);
            }
            if response.len() > tag_len {
                outcome.response = Some(response.into_bytes());
            }
        }
        MESSAGE_AWARENESS => {
            let change = awareness.apply_update(decoder.read_var_bytes()?)?;
            tracing::debug!("Awareness change from {:?}: {:?}", origin, change);
        }
        other => return Err(ProtocolError::UnknownMessageType(other)),
    }

    Ok(outcome)
}
