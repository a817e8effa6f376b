//! Per-device authentication state for CBS-based transports
//!
//! Tracks which credential a device uses and where its SAS token is in its
//! lifecycle. Status changes happen only inside the operations below and in
//! the CBS completion callbacks, which share the status cell with the state.
//!
//! ```text
//!   Idle --authenticate--> InProgress --put ok--> Ok --refresh due--> RefreshRequired
//!                              |  \--put failed--> Failure             |
//!                              \--timeout--> Timeout       <--refresh--/
//! ```
//!
//! X.509 devices skip CBS entirely and go straight from `Idle` to `Ok`.

use crate::cbs::{CbsCompletion, CbsConnection, CbsOperationResult};
use crate::http::OptionValue;
use crate::sas;
use crate::time::{difftime, SystemClock, TimeSource};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationStatus {
    Idle,
    InProgress,
    Ok,
    Timeout,
    Failure,
    RefreshRequired,
}

/// How a device proves its identity
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    X509 {
        certificate: Option<String>,
        private_key: Option<String>,
    },
    DeviceKey(String),
    DeviceSasToken(String),
}

impl Credential {
    /// True for credentials that are presented through CBS
    pub fn uses_cbs(&self) -> bool {
        !matches!(self, Credential::X509 { .. })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::X509 { certificate, .. } => f
                .debug_struct("X509")
                .field("has_certificate", &certificate.is_some())
                .finish_non_exhaustive(),
            Credential::DeviceKey(_) => f.write_str("DeviceKey(..)"),
            Credential::DeviceSasToken(_) => f.write_str("DeviceSasToken(..)"),
        }
    }
}

/// Inputs for [`AuthenticationState::create`]
#[derive(Debug, Clone, Default)]
pub struct AuthenticationConfig {
    pub device_id: String,
    pub iothub_host_fqdn: String,
    pub cbs_connection: Option<Arc<CbsConnection>>,
    pub device_key: Option<String>,
    pub device_sas_token: Option<String>,
}

/// Outcome of one [`AuthenticationState::do_work`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationProgress {
    /// The device may use the connection
    Ready,
    /// A CBS operation is outstanding
    Pending,
}

pub struct AuthenticationState {
    device_id: String,
    iothub_host_fqdn: String,
    devices_path: String,
    cbs_connection: Weak<CbsConnection>,
    credential: Credential,
    sas_token_key_name: String,
    created_at: Option<i64>,
    put_at: Option<i64>,
    status: Arc<Mutex<AuthenticationStatus>>,
    clock: Arc<dyn TimeSource>,
}

impl AuthenticationState {
    pub fn create(config: AuthenticationConfig) -> Result<Self> {
        Self::create_with_clock(config, Arc::new(SystemClock))
    }

    pub fn create_with_clock(
        config: AuthenticationConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        if config.device_id.is_empty() {
            return Err(Error::InvalidArg("device id cannot be empty".to_string()));
        }
        if config.iothub_host_fqdn.is_empty() {
            return Err(Error::InvalidArg("IoT Hub host FQDN cannot be empty".to_string()));
        }
        let cbs_connection = config
            .cbs_connection
            .as_ref()
            .ok_or_else(|| Error::InvalidArg("CBS connection is required".to_string()))?;

        let credential = match (config.device_sas_token, config.device_key) {
            (Some(token), _) => Credential::DeviceSasToken(token),
            (None, Some(key)) => Credential::DeviceKey(key),
            (None, None) => Credential::X509 {
                certificate: None,
                private_key: None,
            },
        };

        let devices_path = format!("{}/devices/{}", config.iothub_host_fqdn, config.device_id);
        debug!(device_id = %config.device_id, ?credential, "Authentication state created");

        Ok(Self {
            device_id: config.device_id,
            iothub_host_fqdn: config.iothub_host_fqdn,
            devices_path,
            cbs_connection: Arc::downgrade(cbs_connection),
            credential,
            sas_token_key_name: String::new(),
            created_at: None,
            put_at: None,
            status: Arc::new(Mutex::new(AuthenticationStatus::Idle)),
            clock,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn iothub_host_fqdn(&self) -> &str {
        &self.iothub_host_fqdn
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Present the device's credential
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub fn authenticate(&mut self) -> Result<()> {
        match &self.credential {
            Credential::DeviceKey(key) => {
                let now = self.clock.now().ok_or(Error::Clock)?;
                let connection = self.connection()?;
                let lifetime = connection.timing().sas_token_lifetime.as_secs() as i64;
                let token = sas::create_token(
                    key,
                    &self.devices_path,
                    &self.sas_token_key_name,
                    now + lifetime,
                )?;
                self.created_at = Some(now);
                self.put_token(&connection, &token, now)
            }
            Credential::DeviceSasToken(token) => {
                let now = self.clock.now().ok_or(Error::Clock)?;
                let connection = self.connection()?;
                let token = token.clone();
                self.put_token(&connection, &token, now)
            }
            Credential::X509 { .. } => {
                let mut status = self.status.lock();
                if *status != AuthenticationStatus::Idle {
                    return Err(Error::InvalidState(format!(
                        "X.509 authentication requires Idle, found {:?}",
                        *status
                    )));
                }
                *status = AuthenticationStatus::Ok;
                info!("X.509 device authenticated");
                Ok(())
            }
        }
    }

    /// Current status, applying any time-based transition first
    pub fn get_status(&self) -> AuthenticationStatus {
        let mut status = self.status.lock();
        if !self.credential.uses_cbs() {
            return *status;
        }

        match *status {
            AuthenticationStatus::InProgress => match self.clock.now() {
                None => {
                    error!(device_id = %self.device_id, "Clock unavailable while waiting on CBS");
                    *status = AuthenticationStatus::Failure;
                }
                Some(now) => {
                    let timeout_ms = self.timing_or_default().cbs_request_timeout.as_millis();
                    let elapsed = difftime(now, self.put_at.unwrap_or(now)).max(0);
                    if (elapsed as u128) * 1000 >= timeout_ms {
                        warn!(device_id = %self.device_id, elapsed, "CBS put-token timed out");
                        *status = AuthenticationStatus::Timeout;
                    }
                }
            },
            AuthenticationStatus::Ok if matches!(self.credential, Credential::DeviceKey(_)) => {
                let refresh_secs = self.timing_or_default().sas_token_refresh_time.as_secs() as i64;
                let due = match (self.clock.now(), self.created_at) {
                    (Some(now), Some(created_at)) => difftime(now, created_at) >= refresh_secs,
                    _ => true,
                };
                if due {
                    debug!(device_id = %self.device_id, "SAS token refresh required");
                    *status = AuthenticationStatus::RefreshRequired;
                }
            }
            _ => {}
        }
        *status
    }

    /// Present a new token; a no-op for X.509
    pub fn refresh(&mut self) -> Result<()> {
        if self.credential.uses_cbs() {
            self.authenticate()
        } else {
            Ok(())
        }
    }

    /// Return to `Idle`, withdrawing the token from CBS when one is live
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub fn reset(&mut self) -> Result<()> {
        if !self.credential.uses_cbs() {
            *self.status.lock() = AuthenticationStatus::Idle;
            return Ok(());
        }

        let previous = *self.status.lock();
        match previous {
            AuthenticationStatus::Failure | AuthenticationStatus::RefreshRequired => {
                *self.status.lock() = AuthenticationStatus::Idle;
                Ok(())
            }
            AuthenticationStatus::Ok | AuthenticationStatus::InProgress => {
                let connection = self.connection()?;
                *self.status.lock() = AuthenticationStatus::Idle;
                let on_complete = self.completion("delete-token", AuthenticationStatus::Idle);
                let dispatched = connection.delete_token(&self.devices_path, on_complete);
                if let Err(e) = dispatched {
                    self.restore(previous);
                    error!("Failed deleting the current SAS token from CBS: {}", e);
                    return Err(e);
                }
                self.created_at = None;
                Ok(())
            }
            AuthenticationStatus::Idle | AuthenticationStatus::Timeout => Err(Error::InvalidState(
                format!("cannot reset authentication in {:?}", previous),
            )),
        }
    }

    /// Set an X.509 option: `x509certificate` or `x509privatekey`
    pub fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<()> {
        let slot = match (&mut self.credential, name) {
            (Credential::X509 { certificate, .. }, "x509certificate") => certificate,
            (Credential::X509 { private_key, .. }, "x509privatekey") => private_key,
            (_, "x509certificate" | "x509privatekey") => {
                return Err(Error::InvalidArg(format!(
                    "{} requires an X.509 credential",
                    name
                )));
            }
            (_, other) => {
                return Err(Error::InvalidArg(format!(
                    "unknown authentication option '{}'",
                    other
                )));
            }
        };
        let value = value
            .as_str()
            .ok_or_else(|| Error::InvalidArg(format!("{} expects a string", name)))?;
        *slot = Some(value.to_string());
        Ok(())
    }

    /// One step of the device authentication loop
    ///
    /// Starts authentication from `Idle`, refreshes when due, and reports
    /// `Failure`/`Timeout` as errors so the caller can decide to `reset`.
    pub fn do_work(&mut self) -> Result<AuthenticationProgress> {
        match self.get_status() {
            AuthenticationStatus::Idle => {
                self.authenticate()?;
                Ok(self.progress())
            }
            AuthenticationStatus::RefreshRequired => {
                self.refresh()?;
                Ok(self.progress())
            }
            AuthenticationStatus::Ok => Ok(AuthenticationProgress::Ready),
            AuthenticationStatus::InProgress => Ok(AuthenticationProgress::Pending),
            AuthenticationStatus::Failure => Err(Error::Cbs(format!(
                "authentication failed for device '{}'",
                self.device_id
            ))),
            AuthenticationStatus::Timeout => Err(Error::Cbs(format!(
                "authentication timed out for device '{}'",
                self.device_id
            ))),
        }
    }

    fn progress(&self) -> AuthenticationProgress {
        match *self.status.lock() {
            AuthenticationStatus::Ok => AuthenticationProgress::Ready,
            _ => AuthenticationProgress::Pending,
        }
    }

    fn connection(&self) -> Result<Arc<CbsConnection>> {
        self.cbs_connection
            .upgrade()
            .ok_or_else(|| Error::InvalidState("CBS connection has been closed".to_string()))
    }

    fn timing_or_default(&self) -> crate::cbs::CbsTiming {
        self.cbs_connection
            .upgrade()
            .map(|c| c.timing())
            .unwrap_or_default()
    }

    fn put_token(&mut self, connection: &CbsConnection, token: &str, now: i64) -> Result<()> {
        // Completion may run before put_token returns.
        let previous = std::mem::replace(&mut *self.status.lock(), AuthenticationStatus::InProgress);
        let dispatched = connection.put_token(
            &self.devices_path,
            token,
            self.completion("put-token", AuthenticationStatus::Ok),
        );
        match dispatched {
            Ok(()) => {
                self.put_at = Some(now);
                debug!("SAS token handed to CBS");
                Ok(())
            }
            Err(e) => {
                self.restore(previous);
                error!("Failed applying new SAS token to CBS: {}", e);
                Err(e)
            }
        }
    }

    fn restore(&self, previous: AuthenticationStatus) {
        *self.status.lock() = previous;
    }

    fn completion(&self, operation: &'static str, on_success: AuthenticationStatus) -> CbsCompletion {
        let status = Arc::clone(&self.status);
        let device_id = self.device_id.clone();
        Box::new(move |result, status_code, description| {
            let mut status = status.lock();
            if result == CbsOperationResult::Ok {
                *status = on_success;
            } else {
                *status = AuthenticationStatus::Failure;
                error!(
                    device_id = %device_id,
                    status_code,
                    "CBS reported error for {} operation: {}",
                    operation,
                    description
                );
            }
        })
    }
}

impl fmt::Debug for AuthenticationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationState")
            .field("device_id", &self.device_id)
            .field("credential", &self.credential)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl Drop for AuthenticationState {
    fn drop(&mut self) {
        debug!(device_id = %self.device_id, "Authentication state released");
    }
}
