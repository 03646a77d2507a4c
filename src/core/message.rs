//! The envelope for one framed unit of received data.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::service::connection::{Connection, WeakConnection};

type MetadataMap = HashMap<String, Box<dyn Any + Send + Sync>>;

/// One reassembled frame, with framing bytes stripped.
///
/// A message holds only a weak reference to the connection that produced it, so
/// keeping a message around never keeps a connection alive. The metadata map is
/// created on first insert and is meant for layered protocols, e.g. a routing code
/// extracted from the payload.
pub struct Message {
    payload: Bytes,
    owner: Option<WeakConnection>,
    metadata: Option<MetadataMap>,
}

impl Message {
    /// Create a message that is not attached to any connection.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            owner: None,
            metadata: None,
        }
    }

    pub(crate) fn from_connection(payload: Bytes, owner: &Connection) -> Self {
        Self {
            payload,
            owner: Some(owner.downgrade()),
            metadata: None,
        }
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The connection that produced this message, if it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.owner.as_ref().and_then(WeakConnection::upgrade)
    }

    /// Attach a metadata value under `key`, replacing any previous value.
    pub fn set_metadata<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Box::new(value));
    }

    /// Look up a metadata value. Returns `None` if absent or of another type.
    pub fn metadata<T: Any>(&self, key: &str) -> Option<&T> {
        self.metadata
            .as_ref()?
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove a metadata value and return it if it has type `T`.
    pub fn remove_metadata<T: Any>(&mut self, key: &str) -> Option<T> {
        let map = self.metadata.as_mut()?;
        match map.remove(key)?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                map.insert(key.to_string(), other);
                None
            }
        }
    }

    /// Whether any metadata has been attached.
    pub fn has_metadata(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| !m.is_empty())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self
            .metadata
            .as_ref()
            .map(|m| m.keys().collect())
            .unwrap_or_default();
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .field("attached", &self.owner.is_some())
            .field("metadata", &keys)
            .finish()
    }
}
