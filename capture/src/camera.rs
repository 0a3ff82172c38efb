//! Frame acquisition.
//!
//! Two sources are supported:
//! - a still image (or a directory of them) continuously refreshed by the
//!   device's frame grabber; the newest file is read on every capture;
//! - a one-shot `ffmpeg` child process grabbing a single frame from a V4L2
//!   device or an RTSP/HTTP stream.
//!
//! Every acquisition goes through [`Session`], which closes the handle when
//! dropped, including on read failure.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use snapcam_common::pipeline::{self, Frame};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// The image acquisition collaborator.
pub trait Camera {
    type Handle;

    fn open_stream(&mut self) -> Result<Self::Handle>;

    /// Read one frame.  `Ok(None)` means the source had nothing to give.
    fn read_frame(&mut self, handle: &mut Self::Handle) -> Result<Option<Frame>>;

    fn close(&mut self, handle: Self::Handle);
}

/// Scoped camera acquisition: the handle is closed when the session drops.
pub struct Session<'a, C: Camera> {
    camera: &'a mut C,
    handle: Option<C::Handle>,
}

impl<'a, C: Camera> Session<'a, C> {
    pub fn open(camera: &'a mut C) -> Result<Self> {
        let handle = camera.open_stream()?;
        Ok(Self {
            camera,
            handle: Some(handle),
        })
    }

    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.handle.as_mut() {
            Some(handle) => self.camera.read_frame(handle),
            None => Ok(None),
        }
    }
}

impl<C: Camera> Drop for Session<'_, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.camera.close(handle);
        }
    }
}

/// Whether `source` names a device or network stream rather than a file.
pub fn is_stream(source: &str) -> bool {
    source.starts_with("/dev/video") || source.contains("://")
}

// ── still-image source ───────────────────────────────────────────────────

/// Reads the newest frame written by an external frame grabber.
pub struct FileCamera {
    source: PathBuf,
}

impl FileCamera {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Newest image file in `dir`, by modification time.
    fn newest_in(dir: &Path) -> Result<Option<PathBuf>> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Cannot list {}", dir.display()))?;

        let newest = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .filter_map(|p| {
                let modified = p.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, p))
            })
            .max_by_key(|(modified, _)| *modified)
            .map(|(_, p)| p);
        Ok(newest)
    }
}

impl Camera for FileCamera {
    type Handle = Option<PathBuf>;

    fn open_stream(&mut self) -> Result<Self::Handle> {
        if self.source.is_dir() {
            Self::newest_in(&self.source)
        } else if self.source.exists() {
            Ok(Some(self.source.clone()))
        } else {
            Ok(None)
        }
    }

    fn read_frame(&mut self, handle: &mut Self::Handle) -> Result<Option<Frame>> {
        let Some(path) = handle.as_ref() else {
            debug!("No frame available at {}", self.source.display());
            return Ok(None);
        };
        let bytes =
            std::fs::read(path).with_context(|| format!("Cannot read frame {}", path.display()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let frame = pipeline::decode(&bytes)
            .with_context(|| format!("Cannot decode frame {}", path.display()))?;
        debug!(
            "Read {}x{} frame from {}",
            frame.width(),
            frame.height(),
            path.display()
        );
        Ok(Some(frame))
    }

    fn close(&mut self, _handle: Self::Handle) {}
}

// ── ffmpeg one-shot grab ─────────────────────────────────────────────────

/// Grabs one frame per capture by spawning `ffmpeg`.
pub struct FfmpegCamera {
    source: String,
    program: String,
}

/// A running grab: the child plus the thread draining its stderr.
pub struct FfmpegGrab {
    child: Child,
    stderr: Option<JoinHandle<Vec<String>>>,
}

impl FfmpegGrab {
    /// Lines ffmpeg wrote to stderr.  Waits for the stream to end.
    fn stderr_lines(&mut self) -> Vec<String> {
        self.stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

impl FfmpegCamera {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            program: "ffmpeg".into(),
        }
    }

    #[cfg(test)]
    fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let url = self.source.as_str();
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);

        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            cmd.args(["-timeout", "10000000"]);
        } else if url.contains("://") {
            cmd.args(["-rw_timeout", "10000000"]);
        } else if url.starts_with("/dev/video") {
            cmd.args(["-f", "v4l2"]);
        }

        cmd.args(["-i", url, "-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Camera for FfmpegCamera {
    type Handle = FfmpegGrab;

    fn open_stream(&mut self) -> Result<Self::Handle> {
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("Failed to spawn ffmpeg for {}", self.source))?;
        debug!("ffmpeg started for {} (pid={})", self.source, child.id());

        // Drain stderr in the background so a chatty ffmpeg cannot fill the
        // pipe and block before it writes the frame.
        let stderr = child.stderr.take().and_then(|stderr| {
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    BufReader::new(stderr)
                        .lines()
                        .map_while(|l| l.ok())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .ok()
        });
        Ok(FfmpegGrab { child, stderr })
    }

    fn read_frame(&mut self, grab: &mut Self::Handle) -> Result<Option<Frame>> {
        let mut png = Vec::new();
        if let Some(mut stdout) = grab.child.stdout.take() {
            stdout
                .read_to_end(&mut png)
                .context("Cannot read ffmpeg output")?;
        }

        let status = grab.child.wait().context("Cannot wait for ffmpeg")?;
        let stderr = grab.stderr_lines();
        if !status.success() || png.is_empty() {
            for line in stderr {
                warn!("[ffmpeg] {line}");
            }
            info!("ffmpeg exited with {status} without a frame");
            return Ok(None);
        }
        if !stderr.is_empty() {
            debug!("ffmpeg wrote {} stderr line(s) on a good grab", stderr.len());
        }

        let frame = pipeline::decode(&png).context("Cannot decode ffmpeg frame")?;
        Ok(Some(frame))
    }

    fn close(&mut self, mut grab: Self::Handle) {
        // Already reaped after a successful read; otherwise stop it now.
        if matches!(grab.child.try_wait(), Ok(None)) {
            let _ = grab.child.kill();
            let _ = grab.child.wait();
        }
        grab.stderr_lines();
    }
}
