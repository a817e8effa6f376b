// SPDX-License-Identifier: MIT
//
// IoT Hub Device Transport
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara

//! Error types for the device transport
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for transport and authentication operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required argument was missing, empty or unknown (including stale handles)
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// The operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The HTTP client failed to execute a request
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport-level failure that is not a client error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The CBS client refused an operation
    #[error("CBS error: {0}")]
    Cbs(String),

    /// The wall clock could not be read
    #[error("Current time is unavailable")]
    Clock,

    /// The operation is not supported by this transport
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result codes surfaced to the owning client layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResult {
    Ok,
    InvalidArg,
    Error,
    Unsupported,
}

impl Error {
    /// Check if error is transient and the unit of work may be retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Transport(_))
    }

    /// Map to the client-visible result code space
    pub fn client_result(&self) -> ClientResult {
        match self {
            Error::InvalidArg(_) => ClientResult::InvalidArg,
            Error::Unsupported(_) => ClientResult::Unsupported,
            _ => ClientResult::Error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl<T> From<Result<T>> for ClientResult {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => ClientResult::Ok,
            Err(e) => e.client_result(),
        }
    }
}
