//! Encoder subprocess abstraction and the ffmpeg implementation.
//!
//! The engine treats the encoder as an opaque subprocess with a known
//! command-line contract: stderr carries diagnostics, exit code 0 with
//! non-empty output means success. The [`Encoder`] trait is the seam tests
//! use to substitute a scripted encoder.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::{RecordingKey, RecordingOutput};
use crate::{Error, Result};

/// Stderr substrings that mark a stream error as fatal for this attempt.
const FATAL_STDERR_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "invalid data found",
    "error opening input",
    "broken pipe",
    "end of file",
];

/// Whether a stderr line matches a fatal stream-error pattern.
pub fn is_fatal_stderr(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    FATAL_STDERR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Filename prefix for a schedule's segment files within its date directory.
pub fn segment_file_prefix(schedule_id: i64) -> String {
    format!("seg{schedule_id}_")
}

/// Events emitted by a running encoder.
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// One line of encoder stderr output.
    Stderr(String),
    /// The process exited; `code` is `None` when killed by signal.
    Exited { code: Option<i32> },
}

/// Parameters for one encoder invocation.
#[derive(Debug, Clone)]
pub struct EncoderJob {
    pub key: RecordingKey,
    /// Input stream URI.
    pub source: String,
    pub bitrate_kbps: u32,
    /// Segment length for segmented output.
    pub segment_duration_secs: u32,
    pub output: RecordingOutput,
}

/// Handle to a spawned encoder process.
pub struct EncoderHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<EncoderEvent>,
}

/// Trait for encoder subprocess implementations.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Spawn the encoder for a job.
    ///
    /// Cancelling `token` requests a graceful stop, escalating to a kill
    /// after the grace window. Exactly one `Exited` event is delivered on
    /// the handle once the process is gone.
    async fn start(&self, job: &EncoderJob, token: CancellationToken) -> Result<EncoderHandle>;

    /// Whether the encoder binary is usable.
    fn is_available(&self) -> bool;

    fn version(&self) -> Option<String>;
}

/// Configuration for the ffmpeg encoder.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderConfig {
    pub binary_path: String,
    /// Time allowed for a graceful quit before the process is killed.
    pub grace_period: Duration,
}

impl Default for FfmpegEncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            grace_period: Duration::from_secs(4),
        }
    }
}

/// FFmpeg-based encoder.
pub struct FfmpegEncoder {
    config: FfmpegEncoderConfig,
    version: Option<String>,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::with_config(FfmpegEncoderConfig::default())
    }

    pub fn with_config(config: FfmpegEncoderConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    /// Detect the ffmpeg version string.
    fn detect_version(path: &str) -> Option<String> {
        std::process::Command::new(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    /// Build the ffmpeg argument list for a job.
    fn build_args(&self, job: &EncoderJob) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "warning".into()];

        // Input options: RTSP over TCP with the auto-reconnect profile.
        args.extend([
            "-rtsp_transport".into(),
            "tcp".into(),
            "-reconnect".into(),
            "1".into(),
            "-reconnect_at_eof".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
        ]);

        args.extend(["-i".into(), job.source.clone()]);

        // Low-latency transcode profile with forced 1s keyframes.
        let bitrate = job.bitrate_kbps;
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-profile:v".into(),
            "baseline".into(),
            "-level".into(),
            "3.0".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-r".into(),
            "30".into(),
            "-g".into(),
            "30".into(),
            "-keyint_min".into(),
            "30".into(),
            "-force_key_frames".into(),
            "expr:gte(t,n_forced*1)".into(),
            "-b:v".into(),
            format!("{bitrate}k"),
            "-maxrate".into(),
            format!("{}k", bitrate * 5 / 4),
            "-bufsize".into(),
            format!("{}k", bitrate * 5 / 2),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ar".into(),
            "44100".into(),
        ]);

        match &job.output {
            RecordingOutput::File { path } => {
                args.extend([
                    "-f".into(),
                    "mp4".into(),
                    "-movflags".into(),
                    "+faststart+frag_keyframe+empty_moov+default_base_moof".into(),
                    path.to_string_lossy().into_owned(),
                ]);
            }
            RecordingOutput::Segmented { dir, manifest } => {
                let pattern = dir.join(format!(
                    "{}%Y%m%d_%H%M%S.mp4",
                    segment_file_prefix(job.key.schedule_id)
                ));
                args.extend([
                    "-f".into(),
                    "segment".into(),
                    "-segment_time".into(),
                    job.segment_duration_secs.to_string(),
                    "-segment_format".into(),
                    "mp4".into(),
                    "-segment_list".into(),
                    manifest.to_string_lossy().into_owned(),
                    "-segment_list_type".into(),
                    "m3u8".into(),
                    "-segment_list_size".into(),
                    "0".into(),
                    "-reset_timestamps".into(),
                    "1".into(),
                    "-strftime".into(),
                    "1".into(),
                    pattern.to_string_lossy().into_owned(),
                ]);
            }
        }

        args
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn start(&self, job: &EncoderJob, token: CancellationToken) -> Result<EncoderHandle> {
        let args = self.build_args(job);
        debug!(key = %job.key, ?args, "Spawning ffmpeg");

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::encoder(format!("failed to spawn {}: {e}", self.config.binary_path)))?;

        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::encoder("failed to capture ffmpeg stderr"))?;

        let (event_tx, events) = mpsc::channel::<EncoderEvent>(64);

        // Stderr reader: forwards lines until the pipe closes on exit.
        let stderr_tx = event_tx.clone();
        let stderr_key = job.key.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if stderr_tx.send(EncoderEvent::Stderr(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(key = %stderr_key, error = %e, "Error reading ffmpeg stderr");
                        break;
                    }
                }
            }
        });

        // Driver: waits for exit, or runs the graceful-then-forceful stop
        // sequence when the token is cancelled.
        let grace = self.config.grace_period;
        let driver_key = job.key.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!(key = %driver_key, error = %e, "Error waiting for ffmpeg");
                        None
                    }
                },
                _ = token.cancelled() => {
                    // Ask ffmpeg to quit cleanly first.
                    if let Some(mut stdin) = child.stdin.take() {
                        let _ = stdin.write_all(b"q").await;
                        let _ = stdin.shutdown().await;
                    }
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(Ok(status)) => status.code(),
                        Ok(Err(e)) => {
                            error!(key = %driver_key, error = %e, "Error waiting for ffmpeg");
                            None
                        }
                        Err(_) => {
                            warn!(key = %driver_key, "Encoder ignored quit request, killing");
                            let _ = child.kill().await;
                            None
                        }
                    }
                }
            };
            let _ = event_tx.send(EncoderEvent::Exited { code }).await;
        });

        Ok(EncoderHandle { pid, events })
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
