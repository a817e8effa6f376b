//! HTTP device transport
//!
//! Owns the set of registered devices and the cooperative work loop. Each
//! [`HttpTransport::do_work`] pass visits every device in registration order,
//! first draining its outbound queue ([`event`]) and then polling for one
//! devicebound message ([`messages`]).

mod device;
mod event;
mod messages;

pub use device::DeviceConfig;

use crate::http::{HttpExecutor, OptionValue};
use crate::message::{DispositionResult, Message};
use crate::metrics::TransportMetrics;
use crate::queue::{ConfirmationResult, MessageQueue, OutboundMessage};
use crate::time::{SystemClock, TimeSource};
use crate::config::TransportConfig;
use crate::{Error, Result};
use device::DeviceRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Opaque identifier of a registered device
///
/// Handles are never reused, so a handle kept after `unregister` stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Callbacks into the client layer that owns a device
pub trait DeviceClient: Send + Sync {
    /// Messages the transport has finished with, in send order
    fn send_complete(&self, messages: Vec<OutboundMessage>, result: ConfirmationResult) {
        for message in messages {
            message.complete(result);
        }
    }

    /// A devicebound message arrived; the verdict decides its disposition
    fn message_received(&self, message: &Message) -> DispositionResult;
}

/// Borrowed view of the transport used while processing one device
pub(crate) struct WorkContext<'a> {
    pub executor: &'a mut dyn HttpExecutor,
    pub clock: &'a dyn TimeSource,
    pub metrics: &'a TransportMetrics,
    pub batching: bool,
    pub minimum_polling_time_secs: u64,
}

pub struct HttpTransport {
    host_name: String,
    executor: Box<dyn HttpExecutor>,
    clock: Arc<dyn TimeSource>,
    metrics: TransportMetrics,
    batching: bool,
    minimum_polling_time_secs: u64,
    devices: Vec<DeviceRecord>,
    device_ids: HashMap<String, DeviceHandle>,
    next_handle: u64,
}

impl HttpTransport {
    pub fn create(config: &TransportConfig, executor: Box<dyn HttpExecutor>) -> Result<Self> {
        Self::create_with_clock(config, executor, Arc::new(SystemClock))
    }

    pub fn create_with_clock(
        config: &TransportConfig,
        executor: Box<dyn HttpExecutor>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        if config.iot_hub_name.is_empty() {
            return Err(Error::InvalidArg("iot_hub_name cannot be empty".to_string()));
        }
        if config.iot_hub_suffix.is_empty() {
            return Err(Error::InvalidArg("iot_hub_suffix cannot be empty".to_string()));
        }

        let host_name = config.host_name();
        info!(host = %host_name, batching = config.batching, "HTTP transport created");

        Ok(Self {
            host_name,
            executor,
            clock,
            metrics: TransportMetrics::new(),
            batching: config.batching,
            minimum_polling_time_secs: config.minimum_polling_time_secs,
            devices: Vec::new(),
            device_ids: HashMap::new(),
            next_handle: 1,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.host_name
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Register a device whose telemetry is read from `queue`
    pub fn register(
        &mut self,
        config: &DeviceConfig,
        queue: MessageQueue,
        client: Arc<dyn DeviceClient>,
    ) -> Result<DeviceHandle> {
        if config.device_id.is_empty() {
            return Err(Error::InvalidArg("device id cannot be empty".to_string()));
        }
        if config.device_key.is_some() && config.device_sas_token.is_some() {
            return Err(Error::InvalidArg(format!(
                "device '{}' has both a key and a SAS token",
                config.device_id
            )));
        }
        if self.device_ids.contains_key(&config.device_id) {
            return Err(Error::InvalidArg(format!(
                "device '{}' is already registered",
                config.device_id
            )));
        }

        let handle = DeviceHandle(self.next_handle);
        let record = DeviceRecord::new(handle, config, &self.host_name, queue, client)?;
        self.next_handle += 1;

        info!(device_id = %config.device_id, auth = record.auth_kind(), "Device registered");
        self.device_ids.insert(config.device_id.clone(), handle);
        self.devices.push(record);
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: DeviceHandle) {
        match self.position(handle) {
            Some(index) => {
                let record = self.devices.remove(index);
                self.device_ids.remove(record.device_id());
                info!(device_id = %record.device_id(), "Device unregistered");
            }
            None => warn!(?handle, "Device handle not found in transport"),
        }
    }

    /// Start polling for devicebound messages
    pub fn subscribe(&mut self, handle: DeviceHandle) -> Result<()> {
        let device = self.device_mut(handle)?;
        device.subscribed = true;
        debug!(device_id = %device.device_id(), "Subscribed to devicebound messages");
        Ok(())
    }

    pub fn unsubscribe(&mut self, handle: DeviceHandle) {
        match self.device_mut(handle) {
            Ok(device) => device.subscribed = false,
            Err(e) => warn!("Unsubscribe ignored: {}", e),
        }
    }

    pub fn subscribe_device_twin(&mut self, _handle: DeviceHandle) -> Result<()> {
        Err(Error::Unsupported("device twin is not available over HTTP".to_string()))
    }

    pub fn unsubscribe_device_twin(&mut self, _handle: DeviceHandle) {
        debug!("Device twin is not available over HTTP");
    }

    pub fn subscribe_device_method(&mut self, _handle: DeviceHandle) -> Result<()> {
        Err(Error::Unsupported("device methods are not available over HTTP".to_string()))
    }

    pub fn unsubscribe_device_method(&mut self, _handle: DeviceHandle) {
        debug!("Device methods are not available over HTTP");
    }

    /// Run one pass over every device
    #[instrument(skip(self), fields(devices = self.devices.len()))]
    pub fn do_work(&mut self) {
        let mut ctx = WorkContext {
            executor: self.executor.as_mut(),
            clock: self.clock.as_ref(),
            metrics: &self.metrics,
            batching: self.batching,
            minimum_polling_time_secs: self.minimum_polling_time_secs,
        };

        for device in self.devices.iter_mut() {
            event::do_event(&mut ctx, device);
            messages::do_messages(&mut ctx, device);
        }
    }

    pub fn get_send_status(&self, handle: DeviceHandle) -> Result<SendStatus> {
        let device = self.device(handle)?;
        Ok(if device.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        })
    }

    /// `Batching` (bool), `MinimumPollingTime` (seconds), or an executor option
    pub fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            "Batching" => {
                self.batching = value
                    .as_bool()
                    .ok_or_else(|| Error::InvalidArg("Batching expects a bool".to_string()))?;
                Ok(())
            }
            "MinimumPollingTime" => {
                self.minimum_polling_time_secs = value.as_u64().ok_or_else(|| {
                    Error::InvalidArg("MinimumPollingTime expects seconds".to_string())
                })?;
                Ok(())
            }
            _ => self.executor.set_option(name, value).map_err(|e| match e {
                Error::InvalidArg(_) | Error::Http(_) => e,
                other => Error::Transport(other.to_string()),
            }),
        }
    }

    pub fn set_retry_policy(&mut self, _policy: &str, _timeout_limit_secs: u64) -> Result<()> {
        Err(Error::Unsupported("retry policy is not available over HTTP".to_string()))
    }

    fn position(&self, handle: DeviceHandle) -> Option<usize> {
        self.devices.iter().position(|d| d.handle() == handle)
    }

    fn device(&self, handle: DeviceHandle) -> Result<&DeviceRecord> {
        self.position(handle)
            .map(|i| &self.devices[i])
            .ok_or_else(|| unknown_handle(handle))
    }

    fn device_mut(&mut self, handle: DeviceHandle) -> Result<&mut DeviceRecord> {
        self.devices
            .iter_mut()
            .find(|d| d.handle() == handle)
            .ok_or_else(|| unknown_handle(handle))
    }
}

fn unknown_handle(handle: DeviceHandle) -> Error {
    Error::InvalidArg(format!("unknown device handle {:?}", handle))
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("host_name", &self.host_name)
            .field("batching", &self.batching)
            .field("minimum_polling_time_secs", &self.minimum_polling_time_secs)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}
