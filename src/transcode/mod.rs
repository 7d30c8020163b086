#![forbid(unsafe_code)]

// Transcoder lifecycle - one ffmpeg process per room turning tapped RTP into HLS

pub mod sdp;

pub use sdp::{build_sdp, SessionDescriptor, StreamTarget};

use crate::metrics::ServerMetrics;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Invalid media descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn transcoder {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ffmpeg_bin: PathBuf,
    /// Per-room output directories are created below this
    pub hls_root: PathBuf,
    /// How long a stopped transcoder may take to flush before it is killed
    pub stop_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            hls_root: PathBuf::from("public/hls"),
            stop_grace: Duration::from_millis(3000),
        }
    }
}

/// Directory name for a room id; anything outside `[A-Za-z0-9_-]` becomes `_`
pub fn room_dir_name(room_id: &str) -> String {
    let name: String = room_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

fn transcoder_args(sdp_path: &Path, playlist_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-protocol_whitelist", "file,udp,rtp", "-f", "sdp", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(sdp_path.display().to_string());
    args.extend(
        [
            "-c:v", "libx264", "-preset", "veryfast", "-g", "48",
            "-c:a", "aac", "-ar", "44100", "-b:a", "128k",
            "-f", "hls", "-hls_time", "2", "-hls_list_size", "5",
            "-hls_flags", "delete_segments",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(playlist_path.display().to_string());
    args
}

struct RunningProcess {
    stop_tx: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
    exited: Arc<AtomicBool>,
}

/// The transcoder subprocess for one room: Stopped or Running
pub struct TranscodeJob {
    room_id: String,
    output_dir: PathBuf,
    config: TranscodeConfig,
    metrics: ServerMetrics,
    process: Option<RunningProcess>,
    spawn_count: usize,
}

impl TranscodeJob {
    pub fn new(room_id: &str, config: TranscodeConfig, metrics: ServerMetrics) -> Self {
        let output_dir = config.hls_root.join(room_dir_name(room_id));
        Self {
            room_id: room_id.to_string(),
            output_dir,
            config,
            metrics,
            process: None,
            spawn_count: 0,
        }
    }

    pub fn sdp_path(&self) -> PathBuf {
        self.output_dir.join("input.sdp")
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join("stream.m3u8")
    }

    /// Playlist location relative to the HLS root, as served under `/hls`
    pub fn playlist_url(&self) -> String {
        format!("/hls/{}/stream.m3u8", room_dir_name(&self.room_id))
    }

    pub fn is_running(&self) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| !p.exited.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub fn spawn_count(&self) -> usize {
        self.spawn_count
    }

    /// Writes the SDP file and spawns the transcoder.
    ///
    /// Returns `Ok(false)` without touching anything while a process is running.
    pub async fn start(&mut self, session: &SessionDescriptor) -> Result<bool, TranscodeError> {
        if self.is_running() {
            debug!("Transcoder for room {} already running", self.room_id);
            return Ok(false);
        }
        // A previous process that died on its own is already reaped by its watcher
        self.process = None;

        let sdp = build_sdp(session)?;
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: self.output_dir.clone(),
                source,
            })?;
        let sdp_path = self.sdp_path();
        tokio::fs::write(&sdp_path, sdp)
            .await
            .map_err(|source| TranscodeError::Io {
                path: sdp_path.clone(),
                source,
            })?;

        let mut child = Command::new(&self.config.ffmpeg_bin)
            .args(transcoder_args(&sdp_path, &self.playlist_path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                bin: self.config.ffmpeg_bin.display().to_string(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let room_id = self.room_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "roomcast::transcoder", room = %room_id, "{}", line);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch(
            child,
            self.room_id.clone(),
            stop_rx,
            exited.clone(),
            self.config.stop_grace,
            self.metrics.clone(),
        ));

        self.spawn_count += 1;
        self.metrics.inc_transcoder_spawns();
        info!(
            "Started transcoder for room {}, writing {}",
            self.room_id,
            self.playlist_path().display()
        );
        self.process = Some(RunningProcess {
            stop_tx,
            watcher,
            exited,
        });
        Ok(true)
    }

    /// Interrupts the transcoder and waits for it to exit (killing it after the
    /// grace period). Returns false if there was nothing to stop.
    pub async fn stop(&mut self) -> bool {
        let Some(process) = self.process.take() else {
            return false;
        };
        let was_running = !process.exited.load(Ordering::Acquire);
        // The watcher may already be gone after an unexpected exit
        let _ = process.stop_tx.send(());
        if let Err(e) = process.watcher.await {
            warn!("Transcoder watcher for room {} failed: {}", self.room_id, e);
        }
        if was_running {
            info!("Stopped transcoder for room {}", self.room_id);
        }
        was_running
    }
}

async fn watch(
    mut child: Child,
    room_id: String,
    stop_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    grace: Duration,
    metrics: ServerMetrics,
) {
    tokio::select! {
        status = child.wait() => {
            exited.store(true, Ordering::Release);
            metrics.inc_transcoder_exits();
            match status {
                Ok(status) => error!("Transcoder for room {} exited unexpectedly ({})", room_id, status),
                Err(e) => error!("Transcoder for room {} could not be awaited: {}", room_id, e),
            }
        }
        _ = stop_rx => {
            interrupt(&mut child, &room_id);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("Transcoder for room {} exited ({})", room_id, status),
                Ok(Err(e)) => warn!("Transcoder for room {} could not be awaited: {}", room_id, e),
                Err(_) => {
                    warn!("Transcoder for room {} ignored SIGINT for {:?}, killing", room_id, grace);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill transcoder for room {}: {}", room_id, e);
                    }
                }
            }
            exited.store(true, Ordering::Release);
        }
    }
}

/// SIGINT lets ffmpeg finalize the playlist
#[cfg(unix)]
fn interrupt(child: &mut Child, room_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!("Failed to interrupt transcoder for room {}: {}", room_id, e);
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child, room_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop transcoder for room {}: {}", room_id, e);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Executable shell script standing in for ffmpeg
    pub(crate) fn fake_transcoder(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn config(dir: &TempDir, body: &str) -> TranscodeConfig {
        TranscodeConfig {
            ffmpeg_bin: fake_transcoder(dir.path(), body),
            hls_root: dir.path().join("hls"),
            stop_grace: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_room_dir_name_is_path_safe() {
        assert_eq!(room_dir_name("lobby-1"), "lobby-1");
        assert_eq!(room_dir_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(room_dir_name(""), "_");
    }

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let dir = TempDir::new().unwrap();
        let mut job = TranscodeJob::new("lobby", config(&dir, "exec sleep 30"), ServerMetrics::new());

        assert!(job.start(&sdp::tests::session()).await.unwrap());
        assert!(!job.start(&sdp::tests::session()).await.unwrap());
        assert_eq!(job.spawn_count(), 1);
        assert!(job.is_running());

        let written = std::fs::read_to_string(job.sdp_path()).unwrap();
        assert!(written.contains("m=audio 20000 RTP/AVP 100"));
        assert_eq!(job.sdp_path(), dir.path().join("hls/lobby/input.sdp"));

        assert!(job.stop().await);
        assert!(!job.stop().await);
        assert!(!job.is_running());
    }

    #[tokio::test]
    async fn test_passes_hls_arguments() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let body = format!("echo \"$@\" > {}\nexec sleep 30", args_file.display());
        let mut job = TranscodeJob::new("lobby", config(&dir, &body), ServerMetrics::new());
        job.start(&sdp::tests::session()).await.unwrap();

        let mut args = String::new();
        for _ in 0..50 {
            args = std::fs::read_to_string(&args_file).unwrap_or_default();
            if !args.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        job.stop().await;

        assert!(args.starts_with("-protocol_whitelist file,udp,rtp -f sdp -i "));
        assert!(args.contains("-f hls -hls_time 2 -hls_list_size 5 -hls_flags delete_segments"));
        assert!(args.trim_end().ends_with("hls/lobby/stream.m3u8"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported_not_restarted() {
        let dir = TempDir::new().unwrap();
        let metrics = ServerMetrics::new();
        let mut job = TranscodeJob::new("lobby", config(&dir, "exit 3"), metrics.clone());
        job.start(&sdp::tests::session()).await.unwrap();

        for _ in 0..100 {
            if !job.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!job.is_running());
        assert_eq!(metrics.transcoder_exits(), 1);
        assert_eq!(job.spawn_count(), 1);
        assert!(!job.stop().await);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let dir = TempDir::new().unwrap();
        let config = TranscodeConfig {
            ffmpeg_bin: dir.path().join("does-not-exist"),
            hls_root: dir.path().join("hls"),
            stop_grace: Duration::from_secs(1),
        };
        let mut job = TranscodeJob::new("lobby", config, ServerMetrics::new());

        let err = job.start(&sdp::tests::session()).await.unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
        assert!(!job.is_running());
        assert_eq!(job.spawn_count(), 0);
    }
}
