//! Configuration management for the device transport

use crate::protocol::DEFAULT_MINIMUM_POLLING_TIME_SECS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix of every environment variable read by this crate
pub const ENV_PREFIX: &str = "IOTHUB_";

/// HTTP transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Hub name, the first label of the hub host
    pub iot_hub_name: String,

    /// Host suffix, e.g. `azure-devices.net`
    pub iot_hub_suffix: String,

    /// Gateway host used instead of `<name>.<suffix>` when set
    #[serde(default)]
    pub protocol_gateway_host_name: Option<String>,

    /// Send telemetry as JSON batches
    #[serde(default)]
    pub batching: bool,

    /// Minimum seconds between devicebound polls
    #[serde(default = "default_minimum_polling_time_secs")]
    pub minimum_polling_time_secs: u64,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl TransportConfig {
    pub fn new(iot_hub_name: impl Into<String>, iot_hub_suffix: impl Into<String>) -> Self {
        Self {
            iot_hub_name: iot_hub_name.into(),
            iot_hub_suffix: iot_hub_suffix.into(),
            protocol_gateway_host_name: None,
            batching: false,
            minimum_polling_time_secs: default_minimum_polling_time_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.iot_hub_name.is_empty() {
            return Err(Error::Config("iot_hub_name cannot be empty".to_string()));
        }
        if self.iot_hub_suffix.is_empty() {
            return Err(Error::Config("iot_hub_suffix cannot be empty".to_string()));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be > 0".to_string()));
        }

        Ok(())
    }

    /// Host the transport connects to
    pub fn host_name(&self) -> String {
        match self.protocol_gateway_host_name.as_deref() {
            Some(gateway) if !gateway.is_empty() => gateway.to_string(),
            _ => format!("{}.{}", self.iot_hub_name, self.iot_hub_suffix),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Identity and pacing of the sample device agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSettings {
    pub device_id: String,

    /// Base64 symmetric key of the device
    #[serde(default)]
    pub device_key: Option<String>,

    /// Pre-built SAS token used instead of a key
    #[serde(default)]
    pub device_sas_token: Option<String>,

    /// PEM certificate file for an X.509 device
    #[serde(default)]
    pub x509_certificate_file: Option<String>,

    /// PEM private key file matching `x509_certificate_file`
    #[serde(default)]
    pub x509_private_key_file: Option<String>,

    /// PEM bundle of extra root certificates
    #[serde(default)]
    pub trusted_certs_file: Option<String>,

    /// Telemetry interval in milliseconds
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    /// Interval between `do_work` passes in milliseconds
    #[serde(default = "default_work_interval_ms")]
    pub work_interval_ms: u64,
}

/// Complete configuration of the sample device agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceAgentConfig {
    pub transport: TransportConfig,
    pub device: DeviceSettings,
}

impl DeviceAgentConfig {
    /// Load configuration from environment variables
    ///
    /// Both sections read the same flat `IOTHUB_*` namespace.
    pub fn from_env() -> Result<Self> {
        let transport: TransportConfig = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        let device: DeviceSettings = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;

        let config = Self { transport, device };
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file with `transport` and `device` sections
    ///
    /// Variables such as `IOTHUB_DEVICE__DEVICE_KEY` override file values.
    pub fn from_file(path: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("IOTHUB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;

        let device = &self.device;
        if device.device_id.is_empty() {
            return Err(Error::Config("device_id cannot be empty".to_string()));
        }
        if device.device_key.is_some() && device.device_sas_token.is_some() {
            return Err(Error::Config(
                "Set either device_key or device_sas_token, not both".to_string(),
            ));
        }
        if device.x509_certificate_file.is_some() != device.x509_private_key_file.is_some() {
            return Err(Error::Config(
                "x509_certificate_file and x509_private_key_file go together".to_string(),
            ));
        }
        if device.x509_certificate_file.is_some()
            && (device.device_key.is_some() || device.device_sas_token.is_some())
        {
            return Err(Error::Config(
                "An X.509 device cannot also use a key or SAS token".to_string(),
            ));
        }
        if device.send_interval_ms == 0 || device.work_interval_ms == 0 {
            return Err(Error::Config("intervals must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.device.send_interval_ms)
    }

    pub fn work_interval(&self) -> Duration {
        Duration::from_millis(self.device.work_interval_ms)
    }
}

/// CBS token timing, all values in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CbsTimingConfig {
    #[serde(default = "default_sas_token_lifetime_ms")]
    pub sas_token_lifetime_ms: u64,

    #[serde(default = "default_sas_token_refresh_time_ms")]
    pub sas_token_refresh_time_ms: u64,

    #[serde(default = "default_cbs_request_timeout_ms")]
    pub cbs_request_timeout_ms: u64,
}

impl Default for CbsTimingConfig {
    fn default() -> Self {
        Self {
            sas_token_lifetime_ms: default_sas_token_lifetime_ms(),
            sas_token_refresh_time_ms: default_sas_token_refresh_time_ms(),
            cbs_request_timeout_ms: default_cbs_request_timeout_ms(),
        }
    }
}

impl CbsTimingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sas_token_refresh_time_ms >= self.sas_token_lifetime_ms {
            return Err(Error::Config(
                "sas_token_refresh_time_ms must be shorter than sas_token_lifetime_ms".to_string(),
            ));
        }
        if self.cbs_request_timeout_ms == 0 {
            return Err(Error::Config("cbs_request_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_minimum_polling_time_secs() -> u64 {
    DEFAULT_MINIMUM_POLLING_TIME_SECS
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_send_interval_ms() -> u64 {
    5_000
}

fn default_work_interval_ms() -> u64 {
    100
}

fn default_sas_token_lifetime_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_sas_token_refresh_time_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_cbs_request_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> DeviceAgentConfig {
        DeviceAgentConfig {
            transport: TransportConfig::new("myhub", "azure-devices.net"),
            device: DeviceSettings {
                device_id: "dev1".to_string(),
                device_key: Some("a2V5".to_string()),
                device_sas_token: None,
                x509_certificate_file: None,
                x509_private_key_file: None,
                trusted_certs_file: None,
                send_interval_ms: 1000,
                work_interval_ms: 100,
            },
        }
    }

    #[test]
    fn test_transport_host_name() {
        let mut config = TransportConfig::new("myhub", "azure-devices.net");
        assert!(config.validate().is_ok());
        assert_eq!(config.host_name(), "myhub.azure-devices.net");
        assert_eq!(config.minimum_polling_time_secs, 1500);

        config.protocol_gateway_host_name = Some("gateway.local".to_string());
        assert_eq!(config.host_name(), "gateway.local");
    }

    #[test]
    fn test_transport_validation() {
        assert!(TransportConfig::new("", "azure-devices.net").validate().is_err());
        assert!(TransportConfig::new("myhub", "").validate().is_err());
    }

    #[test]
    fn test_agent_config_validation() {
        assert!(agent().validate().is_ok());

        let mut both = agent();
        both.device.device_sas_token = Some("SharedAccessSignature sr=x".to_string());
        assert!(both.validate().is_err());

        let mut no_id = agent();
        no_id.device.device_id.clear();
        assert!(no_id.validate().is_err());
    }

    #[test]
    fn test_agent_config_x509_files() {
        let mut x509 = agent();
        x509.device.device_key = None;
        x509.device.x509_certificate_file = Some("dev1.pem".to_string());
        assert!(x509.validate().is_err());

        x509.device.x509_private_key_file = Some("dev1.key".to_string());
        assert!(x509.validate().is_ok());

        x509.device.device_key = Some("a2V5".to_string());
        assert!(x509.validate().is_err());
    }

    #[test]
    fn test_cbs_timing_defaults() {
        let timing = CbsTimingConfig::default();
        assert!(timing.validate().is_ok());
        assert_eq!(timing.sas_token_lifetime_ms, 3_600_000);

        let inverted = CbsTimingConfig {
            sas_token_refresh_time_ms: 7_200_000,
            ..CbsTimingConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
