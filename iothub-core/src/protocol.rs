// SPDX-License-Identifier: MIT
//
// IoT Hub Device Transport
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara

//! Wire format of the hub's HTTP device API
//!
//! Defines request paths, header names, size accounting and the JSON batch
//! format used when batching is enabled.

use crate::message::{Message, MessageContent, Properties};
use crate::sas::{encode_base64, url_encode};
use crate::Result;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::borrow::Cow;

/// Query string appended to every request path
pub const API_VERSION: &str = "?api-version=2016-11-14";

pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_CONNECTION: &str = "Connection";
pub const HEADER_IOTHUB_TO: &str = "iothub-to";
pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_IF_MATCH: &str = "If-Match";
pub const HEADER_MESSAGE_ID: &str = "iothub-messageid";
pub const HEADER_CORRELATION_ID: &str = "iothub-correlationid";

/// Prefix of application property headers and batch property keys
pub const APP_PROPERTY_PREFIX: &str = "iothub-app-";

/// Placeholder replaced by the signer on every request
pub const AUTHORIZATION_PLACEHOLDER: &str = " ";

pub const CONTENT_TYPE_BATCH: &str = "application/vnd.microsoft.iothub.json";
pub const CONTENT_TYPE_SINGLE: &str = "application/octet-stream";
pub const ACCEPT_JSON: &str = "application/json";
pub const CONNECTION_KEEP_ALIVE: &str = "Keep-Alive";

/// Largest request body the hub accepts
pub const MAXIMUM_MESSAGE_SIZE: usize = 255 * 1024 - 1;
/// Fixed per-message framing allowance
pub const MAXIMUM_PAYLOAD_OVERHEAD: usize = 384;
/// Per-property framing allowance
pub const MAXIMUM_PROPERTY_OVERHEAD: usize = 16;

/// 25 minutes between devicebound polls unless configured otherwise
pub const DEFAULT_MINIMUM_POLLING_TIME_SECS: u64 = 25 * 60;

pub fn user_agent() -> String {
    format!("iothubclient/{}", crate::VERSION)
}

/// Budget a message consumes against [`MAXIMUM_MESSAGE_SIZE`]
pub fn message_size(message: &Message) -> usize {
    let properties: usize = message
        .properties()
        .iter()
        .map(|(k, v)| k.len() + v.len() + MAXIMUM_PROPERTY_OVERHEAD)
        .sum();
    message.payload().len() + MAXIMUM_PAYLOAD_OVERHEAD + properties
}

/// `/devices/<id>` with the id URL-encoded
pub fn device_path(device_id: &str) -> String {
    format!("/devices/{}", url_encode(device_id))
}

pub fn event_path(device_id: &str) -> String {
    format!("{}/messages/events{}", device_path(device_id), API_VERSION)
}

/// Value of the `iothub-to` header
pub fn event_destination(device_id: &str) -> String {
    format!("{}/messages/events", device_path(device_id))
}

pub fn message_path(device_id: &str) -> String {
    format!("{}/messages/devicebound{}", device_path(device_id), API_VERSION)
}

/// Prefix of disposition paths; the ETag and suffix follow
pub fn abandon_prefix(device_id: &str) -> String {
    format!("{}/messages/deviceBound/", device_path(device_id))
}

/// Strip the surrounding quotes of an ETag
///
/// Returns `None` unless the value is at least two characters long and both
/// starts and ends with `"`.
pub fn unquote_etag(etag: &str) -> Option<&str> {
    if etag.len() < 2 {
        return None;
    }
    etag.strip_prefix('"')?.strip_suffix('"')
}

/// One element of a batched telemetry array
#[derive(Serialize)]
struct BatchItem<'a> {
    body: Cow<'a, str>,
    #[serde(rename = "base64Encoded", skip_serializing_if = "Option::is_none")]
    base64_encoded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<AppProperties<'a>>,
}

/// Serializes properties in insertion order with the application prefix
struct AppProperties<'a>(&'a Properties);

impl Serialize for AppProperties<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0.iter() {
            map.serialize_entry(&format!("{}{}", APP_PROPERTY_PREFIX, key), value)?;
        }
        map.end()
    }
}

/// Render a message as one JSON batch element
///
/// Byte payloads are base64-encoded; text payloads are embedded as JSON
/// strings flagged with `"base64Encoded":false`.
pub fn render_batch_item(message: &Message) -> Result<String> {
    let (body, base64_encoded) = match message.content() {
        MessageContent::Bytes(bytes) => (Cow::Owned(encode_base64(bytes)), None),
        MessageContent::Text(text) => (Cow::Borrowed(text.as_str()), Some(false)),
    };
    let properties = (!message.properties().is_empty()).then(|| AppProperties(message.properties()));

    let item = BatchItem {
        body,
        base64_encoded,
        properties,
    };
    Ok(serde_json::to_string(&item)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_for_device() {
        assert_eq!(
            event_path("dev1"),
            "/devices/dev1/messages/events?api-version=2016-11-14"
        );
        assert_eq!(
            message_path("dev1"),
            "/devices/dev1/messages/devicebound?api-version=2016-11-14"
        );
        assert_eq!(event_destination("dev1"), "/devices/dev1/messages/events");
        assert_eq!(abandon_prefix("dev1"), "/devices/dev1/messages/deviceBound/");
        assert_eq!(device_path("a/b c"), "/devices/a%2Fb+c");
    }

    #[test]
    fn test_unquote_etag() {
        assert_eq!(unquote_etag("\"abc\""), Some("abc"));
        assert_eq!(unquote_etag("\"\""), Some(""));
        assert_eq!(unquote_etag("abc"), None);
        assert_eq!(unquote_etag("\""), None);
        assert_eq!(unquote_etag("\"abc"), None);
    }

    #[test]
    fn test_message_size() {
        let mut message = Message::from_bytes(vec![0u8; 100]);
        assert_eq!(message_size(&message), 100 + MAXIMUM_PAYLOAD_OVERHEAD);

        message.properties_mut().add_or_update("k", "vv").unwrap();
        assert_eq!(
            message_size(&message),
            100 + MAXIMUM_PAYLOAD_OVERHEAD + 3 + MAXIMUM_PROPERTY_OVERHEAD
        );
    }

    #[test]
    fn test_render_bytes_item() {
        let message = Message::from_bytes(b"hi".to_vec());
        assert_eq!(render_batch_item(&message).unwrap(), r#"{"body":"aGk="}"#);
    }

    #[test]
    fn test_render_text_item_with_properties() {
        let mut message = Message::from_text("say \"hi\"");
        message.properties_mut().add_or_update("z", "1").unwrap();
        message.properties_mut().add_or_update("a", "2").unwrap();

        assert_eq!(
            render_batch_item(&message).unwrap(),
            r#"{"body":"say \"hi\"","base64Encoded":false,"properties":{"iothub-app-z":"1","iothub-app-a":"2"}}"#
        );
    }
}
