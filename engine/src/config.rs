use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

// Engine configuration.
//
// Everything comes from environment variables with sensible defaults so the
// engine can run unconfigured on a dev box and be tuned via a systemd unit in
// production. Values are read once at start-up; a malformed value is a fatal
// start-up error rather than a silent fallback.

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    /// ffmpeg binary (name on PATH or absolute path).
    pub ffmpeg: String,
    /// Where seamless-mode concat manifests are written.
    pub manifest_dir: PathBuf,
    pub watch_interval: Duration,
    /// How long a stopped job gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
    /// Upper bound on waiting for ffmpeg to confirm output. `None` waits forever.
    pub start_timeout: Option<Duration>,
    pub watch_max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            ffmpeg: "ffmpeg".to_string(),
            manifest_dir: std::env::temp_dir(),
            watch_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            start_timeout: Some(Duration::from_secs(30)),
            watch_max_depth: 16,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let bind = match env_opt("PLAYCAST_BIND") {
            Some(v) => v.parse().with_context(|| format!("PLAYCAST_BIND={v}"))?,
            None => d.bind,
        };
        let ffmpeg = env_opt("PLAYCAST_FFMPEG").unwrap_or(d.ffmpeg);
        let manifest_dir = env_opt("PLAYCAST_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or(d.manifest_dir);

        let watch_secs = env_u64("PLAYCAST_WATCH_INTERVAL_SECS", 30)?;
        if watch_secs == 0 {
            anyhow::bail!("PLAYCAST_WATCH_INTERVAL_SECS must be > 0");
        }
        let grace_secs = env_u64("PLAYCAST_STOP_GRACE_SECS", 5)?;
        // 0 disables the start timeout.
        let start_secs = env_u64("PLAYCAST_START_TIMEOUT_SECS", 30)?;
        let watch_max_depth = env_u64("PLAYCAST_WATCH_MAX_DEPTH", d.watch_max_depth as u64)? as usize;

        Ok(Self {
            bind,
            ffmpeg,
            manifest_dir,
            watch_interval: Duration::from_secs(watch_secs),
            stop_grace: Duration::from_secs(grace_secs),
            start_timeout: (start_secs > 0).then(|| Duration::from_secs(start_secs)),
            watch_max_depth,
        })
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match env_opt(name) {
        Some(v) => v
            .parse::<u64>()
            .with_context(|| format!("{name} must be a non-negative integer, got {v:?}")),
        None => Ok(default),
    }
}
