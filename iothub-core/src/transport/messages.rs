//! Cloud-to-device messages and their disposition

use super::device::DeviceRecord;
use super::WorkContext;
use crate::http::{HttpHeaders, HttpMethod, HttpRequest, HttpResponse};
use crate::message::{DispositionResult, Message};
use crate::protocol::{self, API_VERSION};
use crate::time::difftime;
use crate::Result;
use tracing::{debug, error, info, warn};

/// Poll for one devicebound message if the device is subscribed and due
pub(super) fn do_messages(ctx: &mut WorkContext<'_>, device: &mut DeviceRecord) {
    if !device.subscribed {
        return;
    }

    let now = ctx.clock.now();
    let due = match (now, device.last_poll_time) {
        (Some(now), Some(last)) => difftime(now, last) > ctx.minimum_polling_time_secs as i64,
        _ => true,
    };
    if !(device.is_first_poll || due) {
        return;
    }

    let request = HttpRequest {
        method: HttpMethod::Get,
        relative_path: &device.message_path,
        headers: &device.message_headers,
        body: None,
    };
    let response = match device.execute(&mut *ctx.executor, ctx.clock, &request) {
        Ok(response) => response,
        Err(e) => {
            error!(device_id = %device.device_id(), "Unable to poll for messages: {}", e);
            return;
        }
    };

    ctx.metrics.record_poll();
    match now {
        Some(now) => {
            device.is_first_poll = false;
            device.last_poll_time = Some(now);
        }
        None => device.is_first_poll = true,
    }

    match response.status {
        204 => debug!(device_id = %device.device_id(), "No devicebound message waiting"),
        200 => receive(ctx, device, response),
        status => warn!(status, "Unexpected HTTP status polling for messages"),
    }
}

fn receive(ctx: &mut WorkContext<'_>, device: &mut DeviceRecord, response: HttpResponse) {
    let Some(etag) = response.headers.get(protocol::HEADER_ETAG) else {
        error!("Devicebound message has no ETag header");
        return;
    };
    let Some(etag) = protocol::unquote_etag(etag) else {
        error!(etag, "ETag is not a quoted string");
        return;
    };

    let message = match build_message(&response) {
        Ok(message) => message,
        Err(e) => {
            error!("Unable to read devicebound message headers: {}", e);
            dispose(ctx, device, etag, DispositionResult::Abandoned);
            return;
        }
    };

    ctx.metrics.record_message_received();
    let verdict = device.client.message_received(&message);
    info!(device_id = %device.device_id(), ?verdict, "Devicebound message processed");
    dispose(ctx, device, etag, verdict);
}

/// Message from a 200 poll response: body plus `iothub-*` headers
fn build_message(response: &HttpResponse) -> Result<Message> {
    let mut message = Message::from_bytes(response.body.clone());

    for (name, value) in response.headers.iter() {
        if let Some(key) = strip_prefix_ignore_case(name, protocol::APP_PROPERTY_PREFIX) {
            message.properties_mut().add_or_update(key, value)?;
        } else if name.eq_ignore_ascii_case(protocol::HEADER_MESSAGE_ID) {
            message.set_message_id(value);
        } else if name.eq_ignore_ascii_case(protocol::HEADER_CORRELATION_ID) {
            message.set_correlation_id(value);
        }
    }
    Ok(message)
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &name[prefix.len()..])
}

/// Path of the disposition request for an unquoted ETag
fn disposition_path(prefix: &str, etag: &str, result: DispositionResult) -> (HttpMethod, String) {
    match result {
        DispositionResult::Accepted => (HttpMethod::Delete, format!("{}{}{}", prefix, etag, API_VERSION)),
        DispositionResult::Rejected => (
            HttpMethod::Delete,
            format!("{}{}{}&reject", prefix, etag, API_VERSION),
        ),
        DispositionResult::Abandoned => (
            HttpMethod::Post,
            format!("{}{}/abandon{}", prefix, etag, API_VERSION),
        ),
    }
}

/// Settle a devicebound message; failures are logged and not retried
fn dispose(
    ctx: &mut WorkContext<'_>,
    device: &DeviceRecord,
    etag: &str,
    result: DispositionResult,
) {
    let (method, path) = disposition_path(&device.abandon_prefix, etag, result);

    let headers = match disposition_headers(device, etag) {
        Ok(headers) => headers,
        Err(e) => {
            error!("Unable to build disposition headers: {}", e);
            ctx.metrics.record_disposition(false);
            return;
        }
    };

    let request = HttpRequest {
        method,
        relative_path: &path,
        headers: &headers,
        body: None,
    };
    match device.execute(&mut *ctx.executor, ctx.clock, &request) {
        Ok(response) if response.status == 204 => {
            debug!(?result, "Disposition sent");
            ctx.metrics.record_disposition(true);
        }
        Ok(response) => {
            error!(status = response.status, ?result, "Disposition rejected by the hub");
            ctx.metrics.record_disposition(false);
        }
        Err(e) => {
            error!(?result, "Unable to send disposition: {}", e);
            ctx.metrics.record_disposition(false);
        }
    }
}

fn disposition_headers(device: &DeviceRecord, etag: &str) -> Result<HttpHeaders> {
    let mut headers = HttpHeaders::new();
    headers.add(protocol::HEADER_USER_AGENT, protocol::user_agent())?;
    if device.has_authorization() {
        headers.add(
            protocol::HEADER_AUTHORIZATION,
            protocol::AUTHORIZATION_PLACEHOLDER,
        )?;
    }
    headers.add(protocol::HEADER_IF_MATCH, format!("\"{}\"", etag))?;
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_paths() {
        let prefix = "/devices/dev1/messages/deviceBound/";
        assert_eq!(
            disposition_path(prefix, "abc", DispositionResult::Accepted),
            (
                HttpMethod::Delete,
                "/devices/dev1/messages/deviceBound/abc?api-version=2016-11-14".to_string()
            )
        );
        assert_eq!(
            disposition_path(prefix, "abc", DispositionResult::Rejected).1,
            "/devices/dev1/messages/deviceBound/abc?api-version=2016-11-14&reject"
        );
        assert_eq!(
            disposition_path(prefix, "abc", DispositionResult::Abandoned),
            (
                HttpMethod::Post,
                "/devices/dev1/messages/deviceBound/abc/abandon?api-version=2016-11-14".to_string()
            )
        );
    }

    #[test]
    fn test_build_message_from_headers() {
        let mut headers = HttpHeaders::new();
        headers.add("ETag", "\"e1\"").unwrap();
        headers.add("iothub-app-color", "red").unwrap();
        headers.add("IotHub-MessageId", "m-7").unwrap();
        headers.add("iothub-correlationid", "c-7").unwrap();
        headers.add("Content-Length", "2").unwrap();
        let response = HttpResponse {
            status: 200,
            headers,
            body: bytes::Bytes::from_static(b"on"),
        };

        let message = build_message(&response).unwrap();
        assert_eq!(message.payload(), b"on");
        assert_eq!(message.properties().get("color"), Some("red"));
        assert_eq!(message.properties().len(), 1);
        assert_eq!(message.message_id(), Some("m-7"));
        assert_eq!(message.correlation_id(), Some("c-7"));
    }

    #[test]
    fn test_build_message_rejects_empty_property_name() {
        let mut headers = HttpHeaders::new();
        headers.add("iothub-app-", "x").unwrap();
        let response = HttpResponse {
            status: 200,
            headers,
            body: bytes::Bytes::new(),
        };
        assert!(build_message(&response).is_err());
    }
}
