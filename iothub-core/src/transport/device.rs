//! Per-device bookkeeping of the HTTP transport

use super::{DeviceClient, DeviceHandle};
use crate::http::{HttpExecutor, HttpHeaders, HttpRequest, HttpResponse};
use crate::protocol;
use crate::queue::{ConfirmationResult, MessageQueue, OutboundMessage};
use crate::sas::SasSigner;
use crate::time::TimeSource;
use crate::Result;
use std::collections::VecDeque;
use std::sync::Arc;

/// Identity of a device being registered
///
/// With neither a key nor a SAS token the device authenticates with X.509 at
/// the TLS layer.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_key: Option<String>,
    pub device_sas_token: Option<String>,
}

impl DeviceConfig {
    pub fn with_key(device_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: Some(key.into()),
            device_sas_token: None,
        }
    }

    pub fn with_sas_token(device_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: None,
            device_sas_token: Some(token.into()),
        }
    }

    pub fn x509(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }
}

/// How requests of a device are authorized
pub(crate) enum AuthMode {
    /// Fresh token per request from the device key
    Signer(SasSigner),
    /// Caller-supplied token sent verbatim
    SasToken(String),
    /// Client certificate; no Authorization header
    X509,
}

pub(crate) struct DeviceRecord {
    handle: DeviceHandle,
    device_id: String,
    auth: AuthMode,
    pub event_path: String,
    pub message_path: String,
    pub event_headers: HttpHeaders,
    pub message_headers: HttpHeaders,
    pub abandon_prefix: String,
    pub subscribed: bool,
    pub last_poll_time: Option<i64>,
    pub is_first_poll: bool,
    pub queue: MessageQueue,
    pub client: Arc<dyn DeviceClient>,
    pub in_flight: VecDeque<OutboundMessage>,
}

impl DeviceRecord {
    pub fn new(
        handle: DeviceHandle,
        config: &DeviceConfig,
        host_name: &str,
        queue: MessageQueue,
        client: Arc<dyn DeviceClient>,
    ) -> Result<Self> {
        let id = config.device_id.as_str();
        let auth = match (&config.device_key, &config.device_sas_token) {
            (Some(key), _) => AuthMode::Signer(SasSigner::new(
                key.clone(),
                format!("{}{}", host_name, protocol::device_path(id)),
                "",
            )),
            (None, Some(token)) => AuthMode::SasToken(token.clone()),
            (None, None) => AuthMode::X509,
        };
        let has_authorization = !matches!(auth, AuthMode::X509);

        let mut event_headers = HttpHeaders::new();
        event_headers.add(protocol::HEADER_IOTHUB_TO, protocol::event_destination(id))?;
        if has_authorization {
            event_headers.add(
                protocol::HEADER_AUTHORIZATION,
                protocol::AUTHORIZATION_PLACEHOLDER,
            )?;
        }
        event_headers.add(protocol::HEADER_ACCEPT, protocol::ACCEPT_JSON)?;
        event_headers.add(protocol::HEADER_CONNECTION, protocol::CONNECTION_KEEP_ALIVE)?;
        event_headers.add(protocol::HEADER_USER_AGENT, protocol::user_agent())?;

        let mut message_headers = HttpHeaders::new();
        message_headers.add(protocol::HEADER_USER_AGENT, protocol::user_agent())?;
        if has_authorization {
            message_headers.add(
                protocol::HEADER_AUTHORIZATION,
                protocol::AUTHORIZATION_PLACEHOLDER,
            )?;
        }

        Ok(Self {
            handle,
            device_id: config.device_id.clone(),
            auth,
            event_path: protocol::event_path(id),
            message_path: protocol::message_path(id),
            event_headers,
            message_headers,
            abandon_prefix: protocol::abandon_prefix(id),
            subscribed: false,
            last_poll_time: None,
            is_first_poll: true,
            queue,
            client,
            in_flight: VecDeque::new(),
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn auth_kind(&self) -> &'static str {
        match self.auth {
            AuthMode::Signer(_) => "device_key",
            AuthMode::SasToken(_) => "sas_token",
            AuthMode::X509 => "x509",
        }
    }

    pub fn has_authorization(&self) -> bool {
        !matches!(self.auth, AuthMode::X509)
    }

    /// Execute a request authorized the way this device authenticates
    pub fn execute(
        &self,
        executor: &mut dyn HttpExecutor,
        clock: &dyn TimeSource,
        request: &HttpRequest<'_>,
    ) -> Result<HttpResponse> {
        match &self.auth {
            AuthMode::Signer(signer) => signer.execute_signed(executor, clock, request),
            AuthMode::SasToken(token) => {
                let mut headers = request.headers.clone();
                headers.add(protocol::HEADER_AUTHORIZATION, token.as_str())?;
                executor.execute(&HttpRequest {
                    headers: &headers,
                    ..*request
                })
            }
            AuthMode::X509 => executor.execute(request),
        }
    }

    /// Hand every in-flight message back to the client with `result`
    pub fn complete_in_flight(&mut self, result: ConfirmationResult) {
        let messages: Vec<_> = self.in_flight.drain(..).collect();
        if !messages.is_empty() {
            self.client.send_complete(messages, result);
        }
    }

    /// Move in-flight messages back to the head of the queue, order kept
    pub fn requeue_in_flight(&mut self) {
        let messages = std::mem::take(&mut self.in_flight);
        self.queue.requeue_front(messages.into_iter());
    }

    /// Move the queue head to the in-flight list
    pub fn take_head(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(message) => {
                self.in_flight.push_back(message);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DispositionResult, Message};

    struct Client;

    impl DeviceClient for Client {
        fn message_received(&self, _message: &Message) -> DispositionResult {
            DispositionResult::Abandoned
        }
    }

    fn record(config: &DeviceConfig) -> DeviceRecord {
        DeviceRecord::new(
            DeviceHandle(1),
            config,
            "myhub.azure-devices.net",
            MessageQueue::new(),
            Arc::new(Client),
        )
        .unwrap()
    }

    #[test]
    fn test_keyed_device_record() {
        let record = record(&DeviceConfig::with_key("dev1", "c2VjcmV0"));

        assert_eq!(
            record.event_path,
            "/devices/dev1/messages/events?api-version=2016-11-14"
        );
        assert_eq!(
            record.message_path,
            "/devices/dev1/messages/devicebound?api-version=2016-11-14"
        );
        assert_eq!(record.abandon_prefix, "/devices/dev1/messages/deviceBound/");
        assert_eq!(
            record.event_headers.get("iothub-to"),
            Some("/devices/dev1/messages/events")
        );
        assert_eq!(record.event_headers.get("Authorization"), Some(" "));
        assert_eq!(record.event_headers.get("Accept"), Some("application/json"));
        assert_eq!(record.event_headers.get("Connection"), Some("Keep-Alive"));
        assert!(record
            .message_headers
            .get("User-Agent")
            .unwrap()
            .starts_with("iothubclient/"));
        assert!(record.is_first_poll);
        assert!(!record.subscribed);

        match &record.auth {
            AuthMode::Signer(signer) => {
                assert_eq!(signer.uri_resource(), "myhub.azure-devices.net/devices/dev1")
            }
            _ => panic!("expected a signer"),
        }
    }

    #[test]
    fn test_x509_device_has_no_authorization() {
        let record = record(&DeviceConfig::x509("dev1"));
        assert!(!record.has_authorization());
        assert!(record.event_headers.get("Authorization").is_none());
        assert!(record.message_headers.get("Authorization").is_none());
    }

    #[test]
    fn test_take_and_requeue() {
        let mut record = record(&DeviceConfig::with_sas_token("dev1", "tok"));
        for s in ["a", "b"] {
            record.queue.enqueue(OutboundMessage::new(Message::from_text(s)));
        }
        assert!(record.take_head());
        assert!(record.take_head());
        assert!(!record.take_head());

        record.requeue_in_flight();
        assert!(record.in_flight.is_empty());
        assert_eq!(record.queue.len(), 2);
        assert_eq!(
            record.queue.peek_with(|m| m.message().payload().to_vec()),
            Some(b"a".to_vec())
        );
    }
}
