//! Telemetry and devicebound message model

use crate::{Error, Result};
use bytes::Bytes;

/// Payload of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Opaque bytes, base64-encoded inside a batch
    Bytes(Bytes),
    /// Text, carried as a JSON string inside a batch
    Text(String),
}

/// Application properties of a message, kept in insertion order
///
/// Keys and values are restricted to printable US-ASCII (0x20..=0x7E).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing the value of an existing key
    pub fn add_or_update(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(Error::InvalidArg("property key cannot be empty".to_string()));
        }
        if !is_printable_ascii(&key) || !is_printable_ascii(&value) {
            return Err(Error::InvalidArg(format!(
                "property '{}' contains characters outside printable US-ASCII",
                key.escape_default()
            )));
        }

        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (b' '..=b'~').contains(&b))
}

/// A message travelling between device and cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: MessageContent,
    properties: Properties,
    message_id: Option<String>,
    correlation_id: Option<String>,
}

impl Message {
    /// Create a byte-array message
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::with_content(MessageContent::Bytes(data.into()))
    }

    /// Create a string message
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::with_content(MessageContent::Text(text.into()))
    }

    fn with_content(content: MessageContent) -> Self {
        Self {
            content,
            properties: Properties::new(),
            message_id: None,
            correlation_id: None,
        }
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    /// Raw payload bytes regardless of content type
    pub fn payload(&self) -> &[u8] {
        match &self.content {
            MessageContent::Bytes(b) => b,
            MessageContent::Text(s) => s.as_bytes(),
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.message_id = Some(id.into());
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }
}

/// Application verdict for a received devicebound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionResult {
    Accepted,
    Rejected,
    Abandoned,
}
