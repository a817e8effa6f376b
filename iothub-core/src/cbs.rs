//! Claims-based security client seam
//!
//! An AMQP transport authenticates each device by putting a SAS token on the
//! connection's CBS node. Operations complete asynchronously through a boxed
//! callback; [`CbsConnection`] pairs the client with the token timing settings
//! shared by every device on the connection.

use crate::config::CbsTimingConfig;
use crate::http::OptionValue;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Token type passed with every put-token request
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

pub const DEFAULT_SAS_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
pub const DEFAULT_SAS_TOKEN_REFRESH_TIME: Duration = Duration::from_secs(1800);
pub const DEFAULT_CBS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsOperationResult {
    Ok,
    Error,
    OperationFailed,
    InstanceClosed,
}

/// Completion of a CBS operation: result, status code, description
pub type CbsCompletion = Box<dyn FnOnce(CbsOperationResult, u32, &str) + Send>;

/// Client for the CBS node of an AMQP connection
///
/// Returning `Ok` means the request was dispatched; its outcome arrives later
/// through `on_complete`.
pub trait CbsClient: Send {
    fn put_token(
        &mut self,
        token_type: &str,
        audience: &str,
        token: &str,
        on_complete: CbsCompletion,
    ) -> Result<()>;

    fn delete_token(
        &mut self,
        audience: &str,
        token_type: &str,
        on_complete: CbsCompletion,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbsTiming {
    pub sas_token_lifetime: Duration,
    pub sas_token_refresh_time: Duration,
    pub cbs_request_timeout: Duration,
}

impl Default for CbsTiming {
    fn default() -> Self {
        Self {
            sas_token_lifetime: DEFAULT_SAS_TOKEN_LIFETIME,
            sas_token_refresh_time: DEFAULT_SAS_TOKEN_REFRESH_TIME,
            cbs_request_timeout: DEFAULT_CBS_REQUEST_TIMEOUT,
        }
    }
}

impl From<&CbsTimingConfig> for CbsTiming {
    fn from(config: &CbsTimingConfig) -> Self {
        Self {
            sas_token_lifetime: Duration::from_millis(config.sas_token_lifetime_ms),
            sas_token_refresh_time: Duration::from_millis(config.sas_token_refresh_time_ms),
            cbs_request_timeout: Duration::from_millis(config.cbs_request_timeout_ms),
        }
    }
}

/// CBS client plus token timing, shared by all devices of a connection
pub struct CbsConnection {
    client: Mutex<Box<dyn CbsClient>>,
    timing: Mutex<CbsTiming>,
}

impl CbsConnection {
    pub fn new(client: Box<dyn CbsClient>) -> Self {
        Self::with_timing(client, CbsTiming::default())
    }

    pub fn with_timing(client: Box<dyn CbsClient>, timing: CbsTiming) -> Self {
        Self {
            client: Mutex::new(client),
            timing: Mutex::new(timing),
        }
    }

    pub fn timing(&self) -> CbsTiming {
        *self.timing.lock()
    }

    /// Set a timing option; values are milliseconds
    pub fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        let millis = value
            .as_u64()
            .ok_or_else(|| Error::InvalidArg(format!("{} expects milliseconds", name)))?;
        let duration = Duration::from_millis(millis);

        let mut timing = self.timing.lock();
        match name {
            "sas_token_lifetime" => timing.sas_token_lifetime = duration,
            "sas_token_refresh_time" => timing.sas_token_refresh_time = duration,
            "cbs_request_timeout" => timing.cbs_request_timeout = duration,
            other => {
                return Err(Error::InvalidArg(format!("unknown CBS option '{}'", other)));
            }
        }
        debug!(option = name, millis, "CBS timing updated");
        Ok(())
    }

    pub(crate) fn put_token(&self, audience: &str, token: &str, on_complete: CbsCompletion) -> Result<()> {
        self.client
            .lock()
            .put_token(SAS_TOKEN_TYPE, audience, token, on_complete)
    }

    pub(crate) fn delete_token(&self, audience: &str, on_complete: CbsCompletion) -> Result<()> {
        self.client
            .lock()
            .delete_token(audience, SAS_TOKEN_TYPE, on_complete)
    }
}

impl fmt::Debug for CbsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbsConnection")
            .field("timing", &self.timing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refusing;

    impl CbsClient for Refusing {
        fn put_token(&mut self, _: &str, _: &str, _: &str, _: CbsCompletion) -> Result<()> {
            Err(Error::Cbs("closed".to_string()))
        }

        fn delete_token(&mut self, _: &str, _: &str, _: CbsCompletion) -> Result<()> {
            Err(Error::Cbs("closed".to_string()))
        }
    }

    #[test]
    fn test_default_timing() {
        let connection = CbsConnection::new(Box::new(Refusing));
        let timing = connection.timing();
        assert_eq!(timing.sas_token_lifetime, Duration::from_secs(3600));
        assert_eq!(timing.sas_token_refresh_time, Duration::from_secs(1800));
        assert_eq!(timing.cbs_request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_set_option() {
        let connection = CbsConnection::new(Box::new(Refusing));
        connection
            .set_option("cbs_request_timeout", &OptionValue::UInt(5_000))
            .unwrap();
        assert_eq!(connection.timing().cbs_request_timeout, Duration::from_secs(5));

        assert!(matches!(
            connection.set_option("sas_token_lifetime", &OptionValue::Bool(true)),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            connection.set_option("keepalive", &OptionValue::UInt(1)),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_dispatch_failure_propagates() {
        let connection = CbsConnection::new(Box::new(Refusing));
        let result = connection.put_token("aud", "tok", Box::new(|_, _, _| {}));
        assert!(matches!(result, Err(Error::Cbs(_))));
    }
}
