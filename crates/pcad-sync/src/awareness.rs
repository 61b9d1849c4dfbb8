//! Presence state shared alongside a document
//!
//! Each client owns one JSON state (cursor, selected object, user identity)
//! and a clock that increases with every change. Updates carry
//! `(client, clock, json)` triples; a higher clock wins and a `null` state
//! removes the client.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::codec::{CodecError, Decoder, Encoder};

/// Awareness errors
#[derive(Debug, Clone, Error)]
pub enum AwarenessError {
    #[error("Malformed awareness update: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid awareness state: {0}")]
    Json(String),
}

/// Clients touched by an applied update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ClientMeta {
    clock: u64,
}

/// Awareness states of all known clients
#[derive(Debug, Clone)]
pub struct Awareness {
    client_id: u64,
    states: HashMap<u64, Value>,
    meta: HashMap<u64, ClientMeta>,
}

impl Awareness {
    /// Create with an empty local state
    pub fn new(client_id: u64) -> Self {
        let mut awareness = Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        };
        awareness.set_local_state(Some(Value::Object(Default::default())));
        awareness
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    /// Replace the local state, `None` marks this client offline
    pub fn set_local_state(&mut self, state: Option<Value>) {
        let clock = self.meta.get(&self.client_id).map_or(0, |m| m.clock + 1);
        self.meta.insert(self.client_id, ClientMeta { clock });
        match state {
            Some(state) => {
                self.states.insert(self.client_id, state);
            }
            None => {
                self.states.remove(&self.client_id);
            }
        }
    }

    /// Set one field of the local state object
    pub fn set_local_field(&mut self, field: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map.clone(),
            _ => Default::default(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    pub fn states(&self) -> &HashMap<u64, Value> {
        &self.states
    }

    pub fn clock_of(&self, client: u64) -> Option<u64> {
        self.meta.get(&client).map(|m| m.clock)
    }

    /// Encode the states of `clients`
    ///
    /// Clients without a state are encoded as `null` so peers drop them.
    pub fn encode_update(&self, clients: &[u64]) -> Result<Vec<u8>, AwarenessError> {
        let mut encoder = Encoder::new();
        encoder.write_var_uint(clients.len() as u64);
        for client in clients {
            let clock = self.clock_of(*client).unwrap_or(0);
            let json = match self.states.get(client) {
                Some(state) => {
                    serde_json::to_string(state).map_err(|e| AwarenessError::Json(e.to_string()))?
                }
                None => "null".to_string(),
            };
            encoder.write_var_uint(*client);
            encoder.write_var_uint(clock);
            encoder.write_var_string(&json);
        }
        Ok(encoder.into_bytes())
    }

    /// Encode the local state only
    pub fn encode_local_update(&self) -> Result<Vec<u8>, AwarenessError> {
        self.encode_update(&[self.client_id])
    }

    /// Merge a remote update
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChange, AwarenessError> {
        let mut decoder = Decoder::new(update);
        let count = decoder.read_var_uint()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client = decoder.read_var_uint()?;
            let clock = decoder.read_var_uint()?;
            let state: Value = serde_json::from_str(decoder.read_var_string()?)
                .map_err(|e| AwarenessError::Json(e.to_string()))?;
            entries.push((client, clock, state));
        }

        let mut change = AwarenessChange::default();
        for (client, clock, state) in entries {
            // Only this replica writes its own state
            if client == self.client_id {
                continue;
            }

            let current = self.clock_of(client);
            let newer = current.is_none_or(|c| clock > c);
            // Same clock may still remove a client that is present
            let removal = state.is_null() && current == Some(clock) && self.states.contains_key(&client);
            if !newer && !removal {
                continue;
            }

            self.meta.insert(client, ClientMeta { clock });
            if state.is_null() {
                if self.states.remove(&client).is_some() {
                    change.removed.push(client);
                }
            } else if self.states.insert(client, state).is_some() {
                change.updated.push(client);
            } else {
                change.added.push(client);
            }
        }
        Ok(change)
    }
}
