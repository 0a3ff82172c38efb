//! Trigger controller: the operator-side capture → preview → decide loop.
//!
//! The controller keeps exactly one capture in flight.  It moves through
//! explicit states; the preview and acknowledgment waits are bounded by
//! timeouts, the human decision is not.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use snapcam_common::channel::{Delivery, Publish};
use snapcam_common::config::Config;
use snapcam_common::pipeline::{self, Frame};
use snapcam_common::protocol::{to_payload, AckEvent, Command, Preview, PreviewEvent};

/// Upper bound on a single queue wait, so shutdown is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(250);
/// Seen-id history is cleared once it grows past this.
const SEEN_LIMIT: usize = 10_000;

/// A decoded message from one of the device topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Preview(PreviewEvent),
    Ack(AckEvent),
}

/// Topic names the subscription callback dispatches on.
#[derive(Debug, Clone)]
pub struct Topics {
    pub preview: String,
    pub ack: String,
}

/// Decode a delivery into an [`Inbound`] message.  Runs on the subscriber
/// thread, so it only parses.
pub fn decode_inbound(topics: &Topics, delivery: &Delivery) -> Option<Inbound> {
    let decoded = if delivery.topic == topics.preview {
        serde_json::from_slice(&delivery.payload).map(Inbound::Preview)
    } else if delivery.topic == topics.ack {
        serde_json::from_slice(&delivery.payload).map(Inbound::Ack)
    } else {
        debug!("Ignoring message on unexpected topic {}", delivery.topic);
        return None;
    };
    match decoded {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Malformed message on {}: {e}", delivery.topic);
            None
        }
    }
}

/// The operator's verdict on a preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Quit,
    Discard,
}

/// Whoever looks at the previews.
pub trait Operator {
    /// Show the preview and block until the operator decides.
    fn decide(&mut self, id: &str, thumbnail: &Frame) -> Result<Decision>;

    /// Short status line (retrying, saved, ...).
    fn status(&mut self, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub command_topic: String,
    pub preview_timeout: Duration,
    /// Zero skips waiting for the save acknowledgment.
    pub ack_timeout: Duration,
    pub retry_backoff: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_topic: config.command_topic.clone(),
            preview_timeout: config.preview_timeout,
            ack_timeout: config.ack_timeout,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub requests: u64,
    pub previews: u64,
    pub failed_captures: u64,
    pub preview_timeouts: u64,
    pub saves_requested: u64,
    pub saves_acked: u64,
    pub saves_rejected: u64,
    pub ack_timeouts: u64,
    pub discarded: u64,
}

enum State {
    Requesting,
    AwaitingPreview { request: String, deadline: Instant },
    AwaitingDecision { id: String, thumbnail: Frame },
    AwaitingAck { id: String, deadline: Instant },
    Backoff,
    Done,
}

/// What a bounded queue wait produced.
enum Wait {
    Message(Inbound),
    Expired,
    Shutdown,
}

pub struct Controller<O: Operator, P: Publish> {
    operator: O,
    publisher: P,
    inbound: Receiver<Inbound>,
    settings: ControllerSettings,
    seen: HashSet<String>,
    summary: Summary,
}

impl<O: Operator, P: Publish> Controller<O, P> {
    pub fn new(operator: O, publisher: P, inbound: Receiver<Inbound>, settings: ControllerSettings) -> Self {
        Self {
            operator,
            publisher,
            inbound,
            settings,
            seen: HashSet::new(),
            summary: Summary::default(),
        }
    }

    /// Run until the operator quits or `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<Summary> {
        let mut state = State::Requesting;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested – leaving capture loop");
                break;
            }
            state = match state {
                State::Done => break,
                State::Requesting => self.request_capture()?,
                State::AwaitingPreview { request, deadline } => {
                    self.await_preview(request, deadline, shutdown)?
                }
                State::AwaitingDecision { id, thumbnail } => self.decide(id, &thumbnail)?,
                State::AwaitingAck { id, deadline } => self.await_ack(id, deadline, shutdown)?,
                State::Backoff => {
                    self.operator.status("No preview – retrying");
                    self.pause(self.settings.retry_backoff, shutdown);
                    State::Requesting
                }
            };
        }
        Ok(self.summary)
    }

    fn send(&mut self, cmd: &Command) -> Result<()> {
        self.publisher
            .publish(&self.settings.command_topic, &to_payload(cmd))
            .with_context(|| format!("Cannot publish {cmd:?}"))
    }

    fn request_capture(&mut self) -> Result<State> {
        let request = Uuid::new_v4().to_string();
        self.send(&Command::Capture {
            request: Some(request.clone()),
        })?;
        self.summary.requests += 1;
        debug!(%request, "Capture requested");
        Ok(State::AwaitingPreview {
            request,
            deadline: Instant::now() + self.settings.preview_timeout,
        })
    }

    /// Wait for the next inbound message, no later than `deadline`.
    fn wait(&mut self, deadline: Instant, shutdown: &AtomicBool) -> Result<Wait> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(Wait::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Wait::Expired);
            }
            match self.inbound.recv_timeout((deadline - now).min(WAIT_SLICE)) {
                Ok(msg) => return Ok(Wait::Message(msg)),
                Err(RecvTimeoutError::Timeout) => {
                    self.publisher.flush();
                }
                Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Delivery queue closed"),
            }
        }
    }

    /// Sleep for `delay` in slices, returning early on shutdown.
    fn pause(&mut self, delay: Duration, shutdown: &AtomicBool) {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if shutdown.load(Ordering::Relaxed) || now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
            self.publisher.flush();
        }
    }

    fn await_preview(&mut self, request: String, deadline: Instant, shutdown: &AtomicBool) -> Result<State> {
        loop {
            let event = match self.wait(deadline, shutdown)? {
                Wait::Shutdown => return Ok(State::Done),
                Wait::Expired => {
                    warn!(%request, "No preview within {:?}", self.settings.preview_timeout);
                    self.summary.preview_timeouts += 1;
                    return Ok(State::Backoff);
                }
                Wait::Message(Inbound::Ack(ack)) => {
                    debug!("Ignoring late acknowledgment {ack:?}");
                    continue;
                }
                Wait::Message(Inbound::Preview(event)) => event,
            };

            if event.request.as_deref().is_some_and(|r| r != request) {
                debug!("Ignoring stale preview for request {:?}", event.request);
                continue;
            }

            match event.outcome() {
                Preview::Failed { reason } => {
                    warn!("Capture failed on device: {reason}");
                    self.summary.failed_captures += 1;
                    return Ok(State::Backoff);
                }
                Preview::Ready { id, thumbnail } => {
                    if self.seen.contains(&id) {
                        debug!(%id, "Ignoring duplicate preview");
                        continue;
                    }
                    if self.seen.len() > SEEN_LIMIT {
                        self.seen.clear();
                    }
                    self.seen.insert(id.clone());

                    return match pipeline::decode(&thumbnail) {
                        Ok(frame) => {
                            self.summary.previews += 1;
                            info!(%id, "Preview received ({} bytes)", thumbnail.len());
                            Ok(State::AwaitingDecision {
                                id,
                                thumbnail: frame,
                            })
                        }
                        Err(e) => {
                            warn!(%id, "Undecodable thumbnail: {e}");
                            self.summary.failed_captures += 1;
                            Ok(State::Backoff)
                        }
                    };
                }
            }
        }
    }

    fn decide(&mut self, id: String, thumbnail: &Frame) -> Result<State> {
        match self.operator.decide(&id, thumbnail)? {
            Decision::Confirm => {
                info!(%id, "Telling the device to store the capture");
                self.send(&Command::Save { id: id.clone() })?;
                self.summary.saves_requested += 1;
                if self.settings.ack_timeout.is_zero() {
                    return Ok(State::Requesting);
                }
                Ok(State::AwaitingAck {
                    id,
                    deadline: Instant::now() + self.settings.ack_timeout,
                })
            }
            Decision::Quit => Ok(State::Done),
            Decision::Discard => {
                debug!(%id, "Capture discarded");
                self.summary.discarded += 1;
                Ok(State::Requesting)
            }
        }
    }

    fn await_ack(&mut self, id: String, deadline: Instant, shutdown: &AtomicBool) -> Result<State> {
        loop {
            let ack = match self.wait(deadline, shutdown)? {
                Wait::Shutdown => return Ok(State::Done),
                Wait::Expired => {
                    warn!(%id, "No acknowledgment within {:?}", self.settings.ack_timeout);
                    self.summary.ack_timeouts += 1;
                    self.operator.status("Save not acknowledged");
                    return Ok(State::Requesting);
                }
                Wait::Message(Inbound::Preview(event)) => {
                    debug!("Ignoring preview {:?} while awaiting acknowledgment", event.id);
                    continue;
                }
                Wait::Message(Inbound::Ack(ack)) => ack,
            };

            if ack.id().is_some_and(|a| a != id) {
                debug!("Ignoring acknowledgment for {:?}", ack.id());
                continue;
            }

            match ack {
                AckEvent::Saved { key, .. } => {
                    info!(%id, %key, "Capture stored");
                    self.summary.saves_acked += 1;
                    self.operator.status(&format!("Saved {key}"));
                }
                AckEvent::Rejected { error, .. } => {
                    warn!(%id, "Save rejected by device: {error}");
                    self.summary.saves_rejected += 1;
                    self.operator.status(&format!("Not saved: {error}"));
                }
            }
            return Ok(State::Requesting);
        }
    }
}
