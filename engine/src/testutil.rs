// Shared fixtures for process-level tests: shell scripts that behave like the
// parts of ffmpeg the engine cares about.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use tokio::sync::broadcast;

use crate::events::EngineEvent;

#[derive(Clone, Copy, Debug)]
pub enum FakeFfmpeg {
    /// Reports progress, then exits 0.
    Finishes,
    /// Reports progress until SIGTERM.
    RunsUntilTerm,
    /// Reports progress and ignores SIGTERM.
    IgnoresTerm,
    /// Complains on stderr and exits 1 before producing output.
    Fails,
    /// Never reports anything.
    Silent,
    /// Echoes a Latin-1 input path, then floods stderr past the pipe buffer before exiting 0.
    Latin1Stderr,
}

const ALL: [FakeFfmpeg; 6] = [
    FakeFfmpeg::Finishes,
    FakeFfmpeg::RunsUntilTerm,
    FakeFfmpeg::IgnoresTerm,
    FakeFfmpeg::Fails,
    FakeFfmpeg::Silent,
    FakeFfmpeg::Latin1Stderr,
];

const PROGRESS: &str = "printf 'frame=1\\nout_time=00:00:00.033000\\nprogress=continue\\n'";

fn script_body(kind: FakeFfmpeg) -> String {
    match kind {
        FakeFfmpeg::Finishes => format!(
            "echo \"Output #0, flv, to 'dest':\" >&2\n{PROGRESS}\nsleep 0.2\nprintf 'frame=7\\nprogress=end\\n'\nexit 0\n"
        ),
        FakeFfmpeg::RunsUntilTerm => {
            format!("trap 'exit 255' TERM\n{PROGRESS}\nwhile :; do sleep 0.1; done\n")
        }
        FakeFfmpeg::IgnoresTerm => {
            format!("trap '' TERM\n{PROGRESS}\nwhile :; do sleep 0.1; done\n")
        }
        FakeFfmpeg::Fails => "echo 'rtmp://ingest/live/key: Connection refused' >&2\nexit 1\n".to_string(),
        FakeFfmpeg::Silent => "while :; do sleep 0.1; done\n".to_string(),
        FakeFfmpeg::Latin1Stderr => format!(
            "printf 'Input #0, mov, from /m/caf\\351.mp4:\\n' >&2\n{PROGRESS}\n\
             i=0\nwhile [ $i -lt 3000 ]; do echo \"[h264] non-monotonic DTS in output stream, line $i\" >&2; i=$((i+1)); done\n\
             exit 0\n"
        ),
    }
}

/// All scripts are written once per test binary, before any of them runs.
/// Writing an executable while other test threads fork and then exec'ing it
/// fails intermittently with ETXTBSY.
fn script_dir() -> &'static Path {
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::Builder::new().prefix("playcast-fake-ffmpeg").tempdir().unwrap();
        for kind in ALL {
            let path = dir.path().join(script_name(kind));
            std::fs::write(&path, format!("#!/bin/sh\n{}", script_body(kind))).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    })
    .path()
}

fn script_name(kind: FakeFfmpeg) -> String {
    format!("fake-ffmpeg-{kind:?}.sh").to_lowercase()
}

pub fn fake_ffmpeg(kind: FakeFfmpeg) -> PathBuf {
    script_dir().join(script_name(kind))
}

/// Creates empty placeholder media files and returns their paths.
pub fn media_files(dir: &Path, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|n| {
            let p = dir.join(n);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&p, b"").unwrap();
            p.to_string_lossy().to_string()
        })
        .collect()
}

/// Names of everything currently buffered on `rx`.
pub fn drain_names(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev.name().to_string());
    }
    out
}
