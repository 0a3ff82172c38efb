//! Capture agent: turns commands from the command topic into camera
//! captures, preview events and durable saves.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use snapcam_common::channel::{ChannelError, Publish};
use snapcam_common::config::Config;
use snapcam_common::pipeline::{self, Resolution};
use snapcam_common::protocol::{to_payload, AckEvent, Command, PreviewEvent};

use crate::camera::{Camera, Session};
use crate::registry::{CaptureStatus, Lookup, PendingRegistry};
use crate::store::{storage_key, DurableStore, TransientStore};

/// How long the command loop waits before running housekeeping.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("upload of capture {id} failed: {source:#}")]
    Upload {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("transient image for capture {id} unreadable: {source:#}")]
    Transient {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Per-agent settings derived from the config.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub preview_topic: String,
    pub ack_topic: String,
    pub stored: Resolution,
    pub thumbnail: Resolution,
    pub jpeg_quality: u8,
    pub pending_ttl: Duration,
    pub max_pending: usize,
    pub nack_unknown_saves: bool,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            preview_topic: config.preview_topic.clone(),
            ack_topic: config.ack_topic.clone(),
            stored: config.stored()?,
            thumbnail: config.thumbnail()?,
            jpeg_quality: config.jpeg_quality,
            pending_ttl: config.pending_ttl,
            max_pending: config.max_pending,
            nack_unknown_saves: config.nack_unknown_saves,
        })
    }
}

/// Counters shared with the status server.
#[derive(Debug, Default)]
pub struct AgentStats {
    captures: AtomicU64,
    failures: AtomicU64,
    saves: AtomicU64,
    nacks: AtomicU64,
    pending: AtomicUsize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captures: u64,
    pub failures: u64,
    pub saves: u64,
    pub nacks: u64,
    pub pending: usize,
}

impl AgentStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captures: self.captures.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decode a command payload; malformed commands are logged and dropped.
pub fn decode_command(payload: &[u8]) -> Option<Command> {
    match serde_json::from_slice::<Command>(payload) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!(
                "Ignoring malformed command ({e}): {}",
                String::from_utf8_lossy(payload)
            );
            None
        }
    }
}

pub struct CaptureAgent<C: Camera, D: DurableStore> {
    camera: C,
    transient: TransientStore,
    durable: D,
    registry: PendingRegistry,
    settings: AgentSettings,
    stats: Arc<AgentStats>,
}

impl<C: Camera, D: DurableStore> CaptureAgent<C, D> {
    pub fn new(
        camera: C,
        transient: TransientStore,
        durable: D,
        settings: AgentSettings,
        stats: Arc<AgentStats>,
    ) -> Self {
        let registry = PendingRegistry::new(settings.pending_ttl, settings.max_pending);
        Self {
            camera,
            transient,
            durable,
            registry,
            settings,
            stats,
        }
    }

    pub fn handle_command(&mut self, cmd: Command, out: &mut impl Publish) -> Result<(), AgentError> {
        self.expire_stale();
        match cmd {
            Command::Capture { request } => self.capture(request, out),
            Command::Save { id } => self.save(&id, out),
        }
    }

    /// Discard captures nobody confirmed within the TTL.
    pub fn expire_stale(&mut self) {
        for id in self.registry.expire(Instant::now()) {
            self.reclaim(&id);
        }
        self.sync_pending();
    }

    fn capture(&mut self, request: Option<String>, out: &mut impl Publish) -> Result<(), AgentError> {
        let event = match self.take_picture() {
            Ok((id, thumbnail)) => {
                info!(%id, "Capture ready, awaiting confirmation");
                PreviewEvent::ready(&id, &thumbnail, request)
            }
            Err(e) => {
                AgentStats::bump(&self.stats.failures);
                warn!(status = ?CaptureStatus::Failed, "Capture failed: {e:#}");
                PreviewEvent::failed(format!("{e:#}"), request)
            }
        };
        out.publish(&self.settings.preview_topic, &to_payload(&event))?;
        Ok(())
    }

    /// Read one frame, run the pipeline and park the full image.
    /// Returns the new id and the encoded thumbnail.
    fn take_picture(&mut self) -> Result<(String, Vec<u8>)> {
        let frame = {
            let mut session = Session::open(&mut self.camera).context("Cannot open camera")?;
            session
                .read_frame()
                .context("Camera read failed")?
                .context("No picture :(")?
        };

        let id = Uuid::new_v4().to_string();
        let square = pipeline::crop_square(&frame);
        let full = pipeline::encode(&square, &self.settings.stored, self.settings.jpeg_quality)
            .context("Failed to encode full image")?;
        let thumbnail =
            pipeline::thumbnail(&square, &self.settings.thumbnail, self.settings.jpeg_quality)
                .context("Failed to encode thumbnail")?;
        debug!(%id, status = ?CaptureStatus::Captured, "Encoded {} + {} bytes", full.len(), thumbnail.len());

        for evicted in self.registry.make_room() {
            self.reclaim(&evicted);
        }
        self.transient.put(&id, &full)?;
        self.registry.register(&id, Local::now(), Instant::now());

        AgentStats::bump(&self.stats.captures);
        self.sync_pending();
        Ok((id, thumbnail))
    }

    fn save(&mut self, id: &str, out: &mut impl Publish) -> Result<(), AgentError> {
        let captured_at = match self.registry.lookup(id) {
            Lookup::Pending { captured_at } => captured_at,
            Lookup::Saved { key } => {
                debug!(%id, "Already saved as {key}; ignoring duplicate save");
                return Ok(());
            }
            Lookup::Discarded => return self.reject(id, "capture expired before confirmation", out),
            Lookup::Unknown => return self.reject(id, "unknown capture id", out),
        };

        let bytes = match self.transient.read(id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.registry.mark_discarded(id);
                self.sync_pending();
                return self.reject(id, "transient image missing", out);
            }
            Err(source) => {
                return Err(AgentError::Transient {
                    id: id.to_string(),
                    source,
                })
            }
        };

        let key = storage_key(captured_at, id);
        self.durable
            .upload(&key, &bytes, "image/jpeg")
            .map_err(|source| AgentError::Upload {
                id: id.to_string(),
                source,
            })?;

        self.registry.mark_saved(id, &key);
        if let Err(e) = self.transient.remove(id) {
            warn!(%id, "Cannot reclaim transient image: {e:#}");
        }
        AgentStats::bump(&self.stats.saves);
        self.sync_pending();
        info!(%id, %key, "Capture saved");

        let ack = AckEvent::Saved {
            key,
            id: Some(id.to_string()),
        };
        out.publish(&self.settings.ack_topic, &to_payload(&ack))?;
        Ok(())
    }

    fn reject(&mut self, id: &str, reason: &str, out: &mut impl Publish) -> Result<(), AgentError> {
        warn!(%id, "Save rejected: {reason}");
        if !self.settings.nack_unknown_saves {
            return Ok(());
        }
        AgentStats::bump(&self.stats.nacks);
        let nack = AckEvent::Rejected {
            id: id.to_string(),
            error: reason.to_string(),
        };
        out.publish(&self.settings.ack_topic, &to_payload(&nack))?;
        Ok(())
    }

    fn reclaim(&mut self, id: &str) {
        match self.transient.remove(id) {
            Ok(_) => info!(%id, status = ?CaptureStatus::Discarded, "Unconfirmed capture discarded"),
            Err(e) => warn!(%id, "Cannot reclaim transient image: {e:#}"),
        }
    }

    fn sync_pending(&self) {
        self.stats
            .pending
            .store(self.registry.pending_len(), Ordering::Relaxed);
    }
}

/// Handle commands from `rx` until shutdown or until the subscription ends.
pub fn serve<C, D, P>(
    agent: &mut CaptureAgent<C, D>,
    rx: &Receiver<Command>,
    out: &mut P,
    shutdown: &AtomicBool,
) where
    C: Camera,
    D: DurableStore,
    P: Publish,
{
    info!("Capture agent ready");
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(IDLE_TICK) {
            Ok(cmd) => {
                debug!("Command: {cmd:?}");
                if let Err(e) = agent.handle_command(cmd, out) {
                    error!("Command failed: {e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                agent.expire_stale();
                out.flush();
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Command subscription closed");
                break;
            }
        }
    }
    info!("Capture agent stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use image::{Rgb, RgbImage};
    use snapcam_common::channel::MemoryBus;
    use snapcam_common::pipeline::Frame;

    const PREVIEW: &str = "trigger/thumbnail";
    const ACK: &str = "snap/keys";

    /// Camera returning a fixed frame, or failing, and counting releases.
    struct FakeCamera {
        frame: Option<Frame>,
        fail: bool,
        opened: usize,
        closed: usize,
    }

    impl FakeCamera {
        fn working() -> Self {
            Self {
                frame: Some(RgbImage::from_fn(640, 480, |x, y| {
                    Rgb([(x % 256) as u8, (y % 256) as u8, 64])
                })),
                fail: false,
                opened: 0,
                closed: 0,
            }
        }

        fn broken() -> Self {
            Self {
                frame: None,
                fail: true,
                opened: 0,
                closed: 0,
            }
        }
    }

    impl Camera for FakeCamera {
        type Handle = ();

        fn open_stream(&mut self) -> Result<()> {
            self.opened += 1;
            Ok(())
        }

        fn read_frame(&mut self, _handle: &mut ()) -> Result<Option<Frame>> {
            if self.fail {
                anyhow::bail!("VIDIOC_DQBUF: no such device");
            }
            Ok(self.frame.clone())
        }

        fn close(&mut self, _handle: ()) {
            self.closed += 1;
        }
    }

    /// Durable store that records uploads, optionally failing them.
    #[derive(Default)]
    struct RecordingStore {
        uploads: Vec<(String, usize)>,
        fail: bool,
    }

    impl DurableStore for RecordingStore {
        fn upload(&mut self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
            assert_eq!(content_type, "image/jpeg");
            if self.fail {
                anyhow::bail!("bucket unreachable");
            }
            self.uploads.push((key.to_string(), bytes.len()));
            Ok(())
        }
    }

    fn settings(nack: bool) -> AgentSettings {
        let training = Resolution {
            name: "training".into(),
            width: 300,
            height: 300,
        };
        AgentSettings {
            preview_topic: PREVIEW.into(),
            ack_topic: ACK.into(),
            stored: training.clone(),
            thumbnail: training,
            jpeg_quality: 85,
            pending_ttl: Duration::from_secs(300),
            max_pending: 8,
            nack_unknown_saves: nack,
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snapcam_agent_{name}_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn agent(
        camera: FakeCamera,
        dir: &PathBuf,
        nack: bool,
    ) -> CaptureAgent<FakeCamera, RecordingStore> {
        CaptureAgent::new(
            camera,
            TransientStore::new(dir).unwrap(),
            RecordingStore::default(),
            settings(nack),
            Arc::new(AgentStats::default()),
        )
    }

    fn json(payload: &[u8]) -> serde_json::Value {
        serde_json::from_slice(payload).unwrap()
    }

    fn command(text: &str) -> Command {
        decode_command(text.as_bytes()).unwrap()
    }

    /// Capture once and return the issued id.
    fn capture_id(agent: &mut CaptureAgent<FakeCamera, RecordingStore>, bus: &mut MemoryBus) -> String {
        agent
            .handle_command(command(r#"{"action":"capture"}"#), bus)
            .unwrap();
        let last = bus.published(PREVIEW).pop().unwrap();
        json(&last)["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_capture_publishes_preview() {
        let dir = scratch("capture");
        let mut agent = agent(FakeCamera::working(), &dir, true);
        let mut bus = MemoryBus::new();

        agent
            .handle_command(command(r#"{"action":"capture","request":"r-1"}"#), &mut bus)
            .unwrap();

        let previews = bus.published(PREVIEW);
        assert_eq!(previews.len(), 1);
        let event = json(&previews[0]);
        let id = event["id"].as_str().unwrap();
        assert!(!id.is_empty());
        assert!(!event["thumbnail"].as_str().unwrap().is_empty());
        assert_eq!(event["request"], "r-1");
        assert!(bus.published(ACK).is_empty());

        // Full image parked under the id, camera released exactly once.
        assert!(agent.transient.contains(id));
        assert_eq!((agent.camera.opened, agent.camera.closed), (1, 1));
        assert_eq!(agent.registry.status(id), Some(CaptureStatus::PendingConfirmation));

        // The thumbnail is a decodable training-size JPEG.
        let preview: PreviewEvent = serde_json::from_slice(&previews[0]).unwrap();
        let snapcam_common::protocol::Preview::Ready { thumbnail, .. } = preview.outcome() else {
            panic!("expected a ready preview");
        };
        assert_eq!(pipeline::decode(&thumbnail).unwrap().dimensions(), (300, 300));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_camera_failure_publishes_message_only() {
        let dir = scratch("broken");
        let mut agent = agent(FakeCamera::broken(), &dir, true);
        let mut bus = MemoryBus::new();

        agent
            .handle_command(command(r#"{"action":"capture"}"#), &mut bus)
            .unwrap();

        let previews = bus.published(PREVIEW);
        assert_eq!(previews.len(), 1);
        let event = json(&previews[0]);
        assert!(!event["message"].as_str().unwrap().is_empty());
        assert!(event.get("id").is_none());
        assert!(event.get("thumbnail").is_none());
        assert_eq!((agent.camera.opened, agent.camera.closed), (1, 1));
        assert_eq!(agent.stats.snapshot().failures, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_camera_reports_no_picture() {
        let dir = scratch("empty");
        let mut camera = FakeCamera::working();
        camera.frame = None;
        let mut agent = agent(camera, &dir, true);
        let mut bus = MemoryBus::new();

        agent
            .handle_command(command(r#"{"action":"capture"}"#), &mut bus)
            .unwrap();
        let event = json(&bus.published(PREVIEW)[0]);
        assert!(event["message"].as_str().unwrap().contains("No picture"));
        assert_eq!(agent.camera.closed, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_uploads_and_acks_once() {
        let dir = scratch("save");
        let mut agent = agent(FakeCamera::working(), &dir, true);
        let mut bus = MemoryBus::new();
        let id = capture_id(&mut agent, &mut bus);

        let save = format!(r#"{{"action":"save","id":"{id}"}}"#);
        agent.handle_command(command(&save), &mut bus).unwrap();

        let acks = bus.published(ACK);
        assert_eq!(acks.len(), 1);
        let key = json(&acks[0])["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("raw/") && key.ends_with(".jpg"), "{key}");
        assert!(key.contains(&id));
        assert!(!agent.transient.contains(&id));
        assert_eq!(agent.registry.status(&id), Some(CaptureStatus::Saved));

        // A repeated save is a no-op: no second upload, no second ack.
        agent.handle_command(command(&save), &mut bus).unwrap();
        assert_eq!(agent.durable.uploads.len(), 1);
        assert_eq!(bus.published(ACK).len(), 1);
        assert_eq!(agent.stats.snapshot().saves, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_save_is_silent_without_nack() {
        let dir = scratch("unknown_silent");
        let mut agent = agent(FakeCamera::working(), &dir, false);
        let mut bus = MemoryBus::new();

        let result = agent.handle_command(
            command(r#"{"action":"save","id":"nonexistent-uuid"}"#),
            &mut bus,
        );
        assert!(result.is_ok());
        assert_eq!(bus.publish_count(), 0);
        assert!(agent.durable.uploads.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_save_is_nacked() {
        let dir = scratch("unknown_nack");
        let mut agent = agent(FakeCamera::working(), &dir, true);
        let mut bus = MemoryBus::new();

        agent
            .handle_command(command(r#"{"action":"save","id":"nonexistent-uuid"}"#), &mut bus)
            .unwrap();
        let acks = bus.published(ACK);
        assert_eq!(acks.len(), 1);
        let ack: AckEvent = serde_json::from_slice(&acks[0]).unwrap();
        assert!(matches!(ack, AckEvent::Rejected { ref id, .. } if id == "nonexistent-uuid"));
        assert!(agent.durable.uploads.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_upload_failure_keeps_capture_pending() {
        let dir = scratch("upload_fail");
        let mut agent = agent(FakeCamera::working(), &dir, true);
        let mut bus = MemoryBus::new();
        let id = capture_id(&mut agent, &mut bus);

        agent.durable.fail = true;
        let save = format!(r#"{{"action":"save","id":"{id}"}}"#);
        let err = agent.handle_command(command(&save), &mut bus).unwrap_err();
        assert!(matches!(err, AgentError::Upload { .. }));
        assert!(bus.published(ACK).is_empty());
        assert!(agent.transient.contains(&id));

        // Retrying once storage is back succeeds.
        agent.durable.fail = false;
        agent.handle_command(command(&save), &mut bus).unwrap();
        assert_eq!(bus.published(ACK).len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_expired_capture_is_reclaimed_and_nacked() {
        let dir = scratch("expired");
        let mut camera_settings = settings(true);
        camera_settings.pending_ttl = Duration::ZERO;
        let mut agent = CaptureAgent::new(
            FakeCamera::working(),
            TransientStore::new(&dir).unwrap(),
            RecordingStore::default(),
            camera_settings,
            Arc::new(AgentStats::default()),
        );
        let mut bus = MemoryBus::new();
        let id = capture_id(&mut agent, &mut bus);

        agent.expire_stale();
        assert!(!agent.transient.contains(&id));
        assert_eq!(agent.registry.status(&id), Some(CaptureStatus::Discarded));

        let save = format!(r#"{{"action":"save","id":"{id}"}}"#);
        agent.handle_command(command(&save), &mut bus).unwrap();
        let ack: AckEvent = serde_json::from_slice(&bus.published(ACK)[0]).unwrap();
        assert!(matches!(ack, AckEvent::Rejected { .. }));
        assert!(agent.durable.uploads.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_max_pending_supersedes_oldest() {
        let dir = scratch("supersede");
        let mut s = settings(true);
        s.max_pending = 2;
        let mut agent = CaptureAgent::new(
            FakeCamera::working(),
            TransientStore::new(&dir).unwrap(),
            RecordingStore::default(),
            s,
            Arc::new(AgentStats::default()),
        );
        let mut bus = MemoryBus::new();

        let ids: Vec<String> = (0..3).map(|_| capture_id(&mut agent, &mut bus)).collect();
        assert!(!agent.transient.contains(&ids[0]));
        assert!(agent.transient.contains(&ids[1]));
        assert!(agent.transient.contains(&ids[2]));
        assert_eq!(agent.stats.snapshot().pending, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ids_are_unique() {
        let dir = scratch("unique");
        let mut s = settings(true);
        s.max_pending = 64;
        let mut agent = CaptureAgent::new(
            FakeCamera::working(),
            TransientStore::new(&dir).unwrap(),
            RecordingStore::default(),
            s,
            Arc::new(AgentStats::default()),
        );
        let mut bus = MemoryBus::new();

        let mut ids: Vec<String> = (0..20).map(|_| capture_id(&mut agent, &mut bus)).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_malformed_command_is_dropped() {
        assert!(decode_command(b"{not json").is_none());
        assert!(decode_command(br#"{"action":"dance"}"#).is_none());
    }

    /// Publisher that only counts idle flushes.
    #[derive(Default)]
    struct CountingPublisher {
        flushes: usize,
    }

    impl Publish for CountingPublisher {
        fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), ChannelError> {
            Ok(())
        }

        fn flush(&mut self) -> usize {
            self.flushes += 1;
            0
        }
    }

    #[test]
    fn test_idle_tick_flushes_held_back_messages() {
        let dir = scratch("idle");
        let mut agent = agent(FakeCamera::working(), &dir, true);
        let (_tx, rx) = std::sync::mpsc::channel::<Command>();
        let mut out = CountingPublisher::default();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(IDLE_TICK + Duration::from_millis(300));
                stop.store(true, Ordering::Relaxed);
            });
            serve(&mut agent, &rx, &mut out, &stop);
        });

        // No command arrived, yet queued messages got a chance to go out.
        assert!(out.flushes >= 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
