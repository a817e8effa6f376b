//! Device-to-cloud telemetry

use super::device::DeviceRecord;
use super::WorkContext;
use crate::http::{HttpHeaders, HttpMethod, HttpRequest};
use crate::message::Message;
use crate::protocol::{self, MAXIMUM_MESSAGE_SIZE};
use crate::queue::ConfirmationResult;
use crate::Result;
use tracing::{debug, error, warn};

/// Drain what fits of the device's queue in one request
pub(super) fn do_event(ctx: &mut WorkContext<'_>, device: &mut DeviceRecord) {
    if device.queue.is_empty() {
        return;
    }
    if ctx.batching {
        send_batch(ctx, device);
    } else {
        send_single(ctx, device);
    }
}

fn send_batch(ctx: &mut WorkContext<'_>, device: &mut DeviceRecord) {
    if let Err(e) = device
        .event_headers
        .add(protocol::HEADER_CONTENT_TYPE, protocol::CONTENT_TYPE_BATCH)
    {
        error!("Unable to set batch content type: {}", e);
        return;
    }

    let mut payload = String::from("[");
    let mut total_size = 0usize;

    while let Some((rendered, size)) = device.queue.peek_with(|m| {
        (
            protocol::render_batch_item(m.message()),
            protocol::message_size(m.message()),
        )
    }) {
        let is_first = device.in_flight.is_empty();
        let item = match rendered {
            Ok(item) => item,
            Err(e) if is_first => {
                error!(device_id = %device.device_id(), "Unable to render first batch item: {}", e);
                return;
            }
            Err(e) => {
                warn!("Unable to render batch item, sending what fits so far: {}", e);
                break;
            }
        };

        if is_first && size > MAXIMUM_MESSAGE_SIZE {
            warn!(device_id = %device.device_id(), size, "Message exceeds the maximum size");
            device.take_head();
            ctx.metrics.record_events_failed(1);
            device.complete_in_flight(ConfirmationResult::Error);
            return;
        }
        if !is_first && total_size + size > MAXIMUM_MESSAGE_SIZE {
            break;
        }

        if !is_first {
            payload.push(',');
        }
        payload.push_str(&item);
        total_size += size;
        device.take_head();
    }
    payload.push(']');

    let count = device.in_flight.len();
    debug!(device_id = %device.device_id(), count, bytes = payload.len(), "Posting batch");

    let request = HttpRequest {
        method: HttpMethod::Post,
        relative_path: &device.event_path,
        headers: &device.event_headers,
        body: Some(payload.as_bytes()),
    };
    match device.execute(&mut *ctx.executor, ctx.clock, &request) {
        Ok(response) if response.status < 300 => {
            ctx.metrics.record_batch();
            ctx.metrics.record_events_sent(count, payload.len());
            device.complete_in_flight(ConfirmationResult::Ok);
        }
        Ok(response) => {
            error!(status = response.status, "Unexpected HTTP status posting batch");
            device.requeue_in_flight();
        }
        Err(e) => {
            error!("Unable to post batch: {}", e);
            device.requeue_in_flight();
        }
    }
}

fn send_single(ctx: &mut WorkContext<'_>, device: &mut DeviceRecord) {
    let Some(size) = device
        .queue
        .peek_with(|m| protocol::message_size(m.message()))
    else {
        return;
    };

    if size > MAXIMUM_MESSAGE_SIZE {
        warn!(device_id = %device.device_id(), size, "Message exceeds the maximum size");
        device.take_head();
        ctx.metrics.record_events_failed(1);
        device.complete_in_flight(ConfirmationResult::Error);
        return;
    }

    let prepared = device
        .queue
        .peek_with(|m| single_request(&device.event_headers, m.message()));
    let (headers, body) = match prepared {
        Some(Ok(prepared)) => prepared,
        Some(Err(e)) => {
            error!(device_id = %device.device_id(), "Unable to build event request: {}", e);
            return;
        }
        None => return,
    };

    let request = HttpRequest {
        method: HttpMethod::Post,
        relative_path: &device.event_path,
        headers: &headers,
        body: Some(body.as_slice()),
    };
    match device.execute(&mut *ctx.executor, ctx.clock, &request) {
        Ok(response) if response.status < 300 => {
            ctx.metrics.record_events_sent(1, body.len());
            device.take_head();
            device.complete_in_flight(ConfirmationResult::Ok);
        }
        Ok(response) => {
            error!(status = response.status, "Unexpected HTTP status posting event");
        }
        Err(e) => {
            error!("Unable to post event: {}", e);
        }
    }
}

/// Headers and raw body of a single-message POST
fn single_request(base: &HttpHeaders, message: &Message) -> Result<(HttpHeaders, Vec<u8>)> {
    let mut headers = base.clone();
    headers.add(protocol::HEADER_CONTENT_TYPE, protocol::CONTENT_TYPE_SINGLE)?;

    for (key, value) in message.properties().iter() {
        headers.add(format!("{}{}", protocol::APP_PROPERTY_PREFIX, key), value)?;
    }
    if let Some(id) = message.message_id() {
        headers.add(protocol::HEADER_MESSAGE_ID, id)?;
    }
    if let Some(id) = message.correlation_id() {
        headers.add(protocol::HEADER_CORRELATION_ID, id)?;
    }

    Ok((headers, message.payload().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_request_headers() {
        let mut base = HttpHeaders::new();
        base.add("iothub-to", "/devices/dev1/messages/events").unwrap();

        let mut message = Message::from_bytes(b"raw".to_vec());
        message.properties_mut().add_or_update("alert", "high").unwrap();
        message.set_message_id("m-1");

        let (headers, body) = single_request(&base, &message).unwrap();
        assert_eq!(body, b"raw");
        assert_eq!(headers.get("Content-Type"), Some("application/octet-stream"));
        assert_eq!(headers.get("iothub-app-alert"), Some("high"));
        assert_eq!(headers.get("iothub-messageid"), Some("m-1"));
        assert!(headers.get("iothub-correlationid").is_none());
        assert!(base.get("Content-Type").is_none());
    }
}
