//! Snapcam Capture Agent – runs on the camera device.
//!
//! This binary:
//! 1. Reads configuration from `snapcam.conf` (plus environment overrides)
//! 2. Connects to the broker and subscribes to the command topic
//! 3. Captures, previews and saves photos on request
//! 4. Runs an axum status server exposing health and counters

mod agent;
mod camera;
mod registry;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use snapcam_common::channel::{self, BrokerSettings, Publish, RedisPublisher};
use snapcam_common::config::Config;

use crate::agent::{AgentSettings, AgentStats, CaptureAgent};
use crate::camera::{Camera, FfmpegCamera, FileCamera};
use crate::store::{BucketStore, TransientStore};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        snapcam_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;
    let bucket = config.require_bucket()?.to_string();

    info!(
        "Snapcam Capture Agent starting (broker={}, bucket={}, camera={})",
        config.broker_url, bucket, config.camera_source
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── status server ────────────────────────────────────────────────
    let stats = Arc::new(AgentStats::default());
    let server_stats = stats.clone();
    let listen_addr = config.status_listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(server_stats, listen_addr, &SHUTDOWN).await {
            tracing::error!("Status server error: {e:#}");
        }
    });

    // ── agent loop (blocking) ────────────────────────────────────────
    let agent_task = tokio::task::spawn_blocking(move || {
        if camera::is_stream(&config.camera_source) {
            let camera = FfmpegCamera::new(config.camera_source.as_str());
            run_agent(camera, &config, &bucket, stats)
        } else {
            let camera = FileCamera::new(config.camera_source.as_str());
            run_agent(camera, &config, &bucket, stats)
        }
    });
    let result = agent_task.await.context("Agent task panicked")?;

    // Stop the status server whether the agent ended cleanly or not.
    SHUTDOWN.store(true, Ordering::Relaxed);
    let _ = server_handle.await;

    info!("Snapcam Capture Agent stopped");
    result
}

fn run_agent<C: Camera>(
    camera: C,
    config: &Config,
    bucket: &str,
    stats: Arc<AgentStats>,
) -> Result<()> {
    let transient = TransientStore::new(&config.transient_dir)?;
    let durable = BucketStore::new(&config.bucket_root, bucket)?;
    let settings = AgentSettings::from_config(config)?;
    let mut agent = CaptureAgent::new(camera, transient, durable, settings, stats);

    // ── broker ───────────────────────────────────────────────────────
    let broker = BrokerSettings::from_config(config);
    let mut publisher =
        RedisPublisher::connect(broker.clone()).context("Cannot connect to broker")?;

    let (tx, rx) = mpsc::channel();
    let subscriber = channel::subscribe(
        &broker,
        vec![config.command_topic.clone()],
        &SHUTDOWN,
        move |delivery| {
            if let Some(cmd) = agent::decode_command(&delivery.payload) {
                let _ = tx.send(cmd);
            }
        },
    )
    .context("Cannot subscribe to command topic")?;

    agent::serve(&mut agent, &rx, &mut publisher, &SHUTDOWN);

    SHUTDOWN.store(true, Ordering::Relaxed);
    subscriber.join().ok();
    publisher.flush();
    if publisher.pending() > 0 {
        tracing::warn!("{} queued message(s) dropped at shutdown", publisher.pending());
    }
    Ok(())
}
