// SPDX-License-Identifier: MIT
//
// IoT Hub Device Transport
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara

//! IoT Hub Device Agent - Sample device built on the HTTP transport
//!
//! Registers one device, produces a telemetry reading on every tick and drives
//! the transport's work loop, which posts queued readings and polls for
//! cloud-to-device commands.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue  ┌──────────────┐   do_work    ┌──────────────┐
//! │  Telemetry   │ ────────> │ MessageQueue │ ───────────> │   IoT Hub    │
//! │    Loop      │           │   (shared)   │ <─────────── │   (HTTPS)    │
//! └──────────────┘           └──────────────┘   commands   └──────────────┘
//! ```
//!
//! `do_work` blocks on HTTP, so it runs on the blocking thread pool.

use anyhow::{Context, Result};
use clap::Parser;
use iothub_core::{
    config::DeviceAgentConfig,
    http::{OptionValue, ReqwestExecutor},
    metrics::TransportMetrics,
    ConfirmationResult, DeviceClient, DeviceConfig, DispositionResult, HttpTransport, Message,
    MessageQueue, OutboundMessage,
};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "iothub-device")]
#[command(about = "IoT Hub Device Agent - Sends telemetry and receives commands over HTTP", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// YAML configuration file; IOTHUB_* environment variables are used when absent
    #[arg(short, long)]
    config: Option<String>,

    /// Do not poll for cloud-to-device messages
    #[arg(long)]
    no_commands: bool,
}

/// Logs commands and accepts anything with a payload
struct CommandHandler {
    device_id: String,
}

impl DeviceClient for CommandHandler {
    fn message_received(&self, message: &Message) -> DispositionResult {
        if message.payload().is_empty() {
            warn!(device_id = %self.device_id, "Rejecting empty command");
            return DispositionResult::Rejected;
        }

        let properties: Vec<String> = message
            .properties()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        info!(
            device_id = %self.device_id,
            message_id = message.message_id().unwrap_or("-"),
            properties = %properties.join(","),
            "Command received: {}",
            String::from_utf8_lossy(message.payload())
        );
        DispositionResult::Accepted
    }
}

/// Main agent application state
struct DeviceAgent {
    config: DeviceAgentConfig,
    transport: Arc<Mutex<HttpTransport>>,
    queue: MessageQueue,
    metrics: TransportMetrics,
    sequence: AtomicU64,
}

impl DeviceAgent {
    /// Build the transport and register the device
    ///
    /// Must run on a blocking thread: the executor owns a blocking HTTP client.
    fn new(config: DeviceAgentConfig, subscribe: bool) -> Result<Self> {
        let executor = ReqwestExecutor::new(
            &config.transport.host_name(),
            config.transport.request_timeout(),
        )
        .context("Failed to create HTTP executor")?;

        let mut transport = HttpTransport::create(&config.transport, Box::new(executor))
            .context("Failed to create HTTP transport")?;

        let tls_files = [
            ("TrustedCerts", &config.device.trusted_certs_file),
            ("x509certificate", &config.device.x509_certificate_file),
            ("x509privatekey", &config.device.x509_private_key_file),
        ];
        for (option, path) in tls_files {
            if let Some(path) = path {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path))?;
                transport
                    .set_option(option, &OptionValue::Str(pem))
                    .with_context(|| format!("Failed to apply {} from {}", option, path))?;
            }
        }

        let device = DeviceConfig {
            device_id: config.device.device_id.clone(),
            device_key: config.device.device_key.clone(),
            device_sas_token: config.device.device_sas_token.clone(),
        };
        let queue = MessageQueue::new();
        let handler = Arc::new(CommandHandler {
            device_id: device.device_id.clone(),
        });
        let handle = transport
            .register(&device, queue.clone(), handler)
            .context("Failed to register device")?;

        if subscribe {
            transport
                .subscribe(handle)
                .context("Failed to subscribe to commands")?;
        }

        let metrics = transport.metrics();
        Ok(Self {
            config,
            transport: Arc::new(Mutex::new(transport)),
            queue,
            metrics,
            sequence: AtomicU64::new(0),
        })
    }

    /// Main run loop
    async fn run(self: Arc<Self>) -> Result<()> {
        info!("Device '{}' connected to {}", self.config.device.device_id, self.transport.lock().hostname());
        info!("Telemetry interval: {:?}", self.config.send_interval());
        info!("Work interval: {:?}", self.config.work_interval());
        info!("Batching: {}", self.config.transport.batching);

        let telemetry_handle = {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.telemetry_loop().await })
        };

        let work_handle = {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.work_loop().await })
        };

        let shutdown = Self::wait_for_shutdown().await;

        telemetry_handle.abort();
        work_handle.abort();
        let _ = telemetry_handle.await;
        let _ = work_handle.await;

        info!("Shutdown signal received, flushing {} queued message(s)...", self.queue.len());
        if let Err(e) = self.work_once().await {
            error!("Failed to flush queue on shutdown: {}", e);
        }

        let snapshot = self.metrics.snapshot();
        info!(
            events_sent = snapshot.events_sent,
            events_failed = snapshot.events_failed,
            batches_posted = snapshot.batches_posted,
            polls_issued = snapshot.polls_issued,
            messages_received = snapshot.messages_received,
            dispositions_sent = snapshot.dispositions_sent,
            dispositions_failed = snapshot.dispositions_failed,
            "Final transport metrics"
        );

        // The blocking HTTP client must not be dropped on a runtime thread.
        tokio::task::spawn_blocking(move || drop(self))
            .await
            .context("Failed to release transport")?;

        info!("Device agent shut down gracefully");
        shutdown
    }

    /// Telemetry loop: enqueue one reading per tick
    async fn telemetry_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.send_interval());

        loop {
            ticker.tick().await;

            match self.reading() {
                Ok(message) => {
                    let sequence = self.sequence.load(Ordering::Relaxed);
                    self.queue.enqueue(OutboundMessage::with_callback(
                        message,
                        Box::new(move |result| match result {
                            ConfirmationResult::Ok => info!(sequence, "Telemetry delivered"),
                            ConfirmationResult::Error => error!(sequence, "Telemetry dropped"),
                        }),
                    ));
                }
                Err(e) => error!("Failed to build telemetry: {}", e),
            }
        }
    }

    /// Work loop: drive the transport on the blocking pool
    async fn work_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.work_interval());

        loop {
            ticker.tick().await;
            if let Err(e) = self.work_once().await {
                error!("Transport work failed: {}", e);
            }
        }
    }

    async fn work_once(&self) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || transport.lock().do_work())
            .await
            .context("Transport worker panicked")
    }

    /// Simulated sensor reading
    fn reading(&self) -> Result<Message> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let (temperature, humidity) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(20.0..30.0_f64), rng.gen_range(40.0..70.0_f64))
        };

        let body = serde_json::json!({
            "deviceId": self.config.device.device_id,
            "sequence": sequence,
            "temperature": (temperature * 10.0).round() / 10.0,
            "humidity": (humidity * 10.0).round() / 10.0,
        });

        let mut message = Message::from_text(body.to_string());
        message.set_message_id(uuid::Uuid::new_v4().to_string());
        message
            .properties_mut()
            .add_or_update("temperatureAlert", (temperature > 28.0).to_string())?;
        Ok(message)
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    async fn wait_for_shutdown() -> Result<()> {
        #[cfg(unix)]
        {
            use futures::stream::StreamExt;
            use signal_hook::consts::signal::*;
            use signal_hook_tokio::Signals;

            let mut signals =
                Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;

            if let Some(signal) = signals.next().await {
                info!("Received signal: {:?}", signal);
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C signal");
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("IoT Hub Device Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            DeviceAgentConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path))?
        }
        None => {
            info!("Loading configuration from environment variables");
            DeviceAgentConfig::from_env().context("Failed to load configuration from environment")?
        }
    };

    let subscribe = !args.no_commands;
    let agent = tokio::task::spawn_blocking(move || DeviceAgent::new(config, subscribe))
        .await
        .context("Device agent setup panicked")??;

    Arc::new(agent).run().await
}
