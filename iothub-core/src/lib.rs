// SPDX-License-Identifier: MIT
//
// IoT Hub Device Transport
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara

//! IoT Hub Device Transport Core Library
//!
//! Moves device telemetry to an IoT hub over HTTP and pulls cloud-to-device
//! messages back, and tracks the CBS authentication state an AMQP transport
//! needs for each device.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `transport`: HTTP work loop, device registry, batching and dispositions
//! - `auth`: Per-device CBS/SAS token state machine
//! - `cbs`: Claims-based security client seam and token timing
//! - `sas`: SAS token construction and request signing
//! - `http`: HTTP execution seam and the reqwest-backed executor
//! - `protocol`: Paths, headers, size accounting and batch JSON
//! - `message` / `queue`: Message model and the shared outbound queue
//! - `config`: Configuration management with validation
//! - `error`: Unified error types
//!
//! Nothing here spawns threads or tasks. The owner drives progress by calling
//! [`transport::HttpTransport::do_work`] and [`auth::AuthenticationState::do_work`].

pub mod auth;
pub mod cbs;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod sas;
pub mod time;
pub mod transport;

pub use error::{ClientResult, Error, Result};
pub use message::{DispositionResult, Message};
pub use queue::{ConfirmationResult, MessageQueue, OutboundMessage};
pub use transport::{DeviceClient, DeviceConfig, DeviceHandle, HttpTransport, SendStatus};

/// Library version, reported in the User-Agent header
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
