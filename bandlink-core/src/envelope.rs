//! Envelope framing: `{"tag": ..., ...fields}` JSON objects, and per-tag handler routing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

const TAG_FIELD: &str = "tag";

/// One tagged message. Payload fields sit next to `tag` at the top level.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: String,
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Wrap a payload. The payload must serialize to a JSON object.
    pub fn new<T: Serialize>(tag: &str, payload: &T) -> Result<Self, EnvelopeError> {
        let mut fields = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            _ => return Err(EnvelopeError::NotAnObject),
        };
        fields.remove(TAG_FIELD);
        Ok(Self {
            tag: tag.to_string(),
            fields,
        })
    }

    /// Encode to the wire string, tag merged into the payload object.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let mut obj = self.fields.clone();
        obj.insert(TAG_FIELD.to_string(), Value::String(self.tag.clone()));
        Ok(serde_json::to_string(&Value::Object(obj))?)
    }

    /// Decode a wire string. The remaining fields become the payload.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let mut fields = match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(EnvelopeError::NotAnObject),
        };
        match fields.remove(TAG_FIELD) {
            Some(Value::String(tag)) => Ok(Self { tag, fields }),
            _ => Err(EnvelopeError::MissingTag),
        }
    }

    /// Deserialize the payload fields into a typed message.
    pub fn payload<T: DeserializeOwned>(self) -> Result<T, EnvelopeError> {
        payload_from(self.fields)
    }
}

/// Deserialize payload fields, as handed to a tag handler, into a typed message.
pub fn payload_from<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T, EnvelopeError> {
    Ok(serde_json::from_value(Value::Object(fields))?)
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string tag")]
    MissingTag,
}

/// Single-subscriber routing table: at most one handler per tag.
#[derive(Debug)]
pub struct TagRouter<H> {
    handlers: HashMap<String, H>,
}

impl<H> TagRouter<H> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Fails if the tag already has one; use `replace` to override.
    pub fn register(&mut self, tag: &str, handler: H) -> Result<(), RouterError> {
        if self.handlers.contains_key(tag) {
            return Err(RouterError::AlreadyRegistered(tag.to_string()));
        }
        self.handlers.insert(tag.to_string(), handler);
        Ok(())
    }

    /// Install a handler, returning the one it replaced.
    pub fn replace(&mut self, tag: &str, handler: H) -> Option<H> {
        self.handlers.insert(tag.to_string(), handler)
    }

    pub fn remove(&mut self, tag: &str) -> Option<H> {
        self.handlers.remove(tag)
    }

    pub fn get(&self, tag: &str) -> Option<&H> {
        self.handlers.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }
}

impl<H> Default for TagRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("handler already registered for tag {0:?}")]
    AlreadyRegistered(String),
}
