//! Snapcam Trigger – the operator's console.
//!
//! Requests captures from the device, shows each preview in the terminal
//! and tells the device to keep or drop it.  Logs go to stderr so they can
//! be redirected away from the preview screen.

mod controller;
mod operator;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use anyhow::{Context, Result};
use tracing::info;

use snapcam_common::channel::{self, BrokerSettings, RedisPublisher};
use snapcam_common::config::Config;

use crate::controller::{Controller, ControllerSettings, Topics};
use crate::operator::TerminalOperator;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        snapcam_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!("Snapcam Trigger starting (broker={})", config.broker_url);

    // Nothing is requested until the broker is reachable.
    let broker = BrokerSettings::from_config(&config);
    let publisher = RedisPublisher::connect(broker.clone()).context("Cannot connect to broker")?;

    let (tx, rx) = mpsc::channel();
    let topics = Topics {
        preview: config.preview_topic.clone(),
        ack: config.ack_topic.clone(),
    };
    let subscriber = channel::subscribe(
        &broker,
        vec![topics.preview.clone(), topics.ack.clone()],
        &SHUTDOWN,
        move |delivery| {
            if let Some(msg) = controller::decode_inbound(&topics, &delivery) {
                let _ = tx.send(msg);
            }
        },
    )
    .context("Cannot subscribe to device topics")?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("Cannot set Ctrl-C handler")?;

    let result = {
        let operator = TerminalOperator::open()?;
        let mut controller =
            Controller::new(operator, publisher, rx, ControllerSettings::from_config(&config));
        controller.run(&SHUTDOWN)
        // controller (and the terminal) dropped here
    };

    SHUTDOWN.store(true, Ordering::Relaxed);
    subscriber.join().ok();

    let summary = result?;
    info!(
        "Snapcam Trigger stopped: {} request(s), {} preview(s), {} saved, {} discarded",
        summary.requests, summary.previews, summary.saves_acked, summary.discarded
    );
    Ok(())
}
