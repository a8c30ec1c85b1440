use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{EngineError, EngineResult},
};

// --- Folder watches ---------------------------------------------------------------
//
// A watch binds a directory to a playlist. One timer for the whole process
// rescans every watched directory and appends files the playlist doesn't
// have yet. Scanning is plain polling; no inotify.

/// Video containers ffmpeg reads reliably. Anything else in a watched folder
/// (sidecar subtitles, thumbnails, partial downloads) is ignored.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "flv", "m4v", "ts", "mpg", "mpeg", "wmv"];

#[derive(Clone, Debug, Serialize)]
pub struct FolderWatch {
    pub playlist_id: Uuid,
    pub dir: PathBuf,
    pub recursive: bool,
    /// Unix millis of the last sweep.
    pub last_checked_ms: Option<u64>,
}

/// Lists video files under `dir`.
///
/// Walks with an explicit stack rather than recursion and never descends
/// more than `max_depth` levels below `dir`. Within a directory, files come
/// in name order and before the contents of its subdirectories.
pub fn scan_video_files(dir: &Path, recursive: bool, max_depth: usize) -> EngineResult<Vec<String>> {
    if !dir.is_dir() {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        )));
    }

    let mut out = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), 0usize)];
    while let Some((path, depth)) = stack.pop() {
        let mut entries = Vec::new();
        for ent in std::fs::read_dir(&path)? {
            entries.push(ent?.path());
        }
        entries.sort();

        let mut subdirs = Vec::new();
        for p in entries {
            if p.is_dir() {
                if recursive && depth < max_depth {
                    subdirs.push(p);
                }
                continue;
            }
            if !p.is_file() || !is_video(&p) {
                continue;
            }
            // Non-UTF8 names survive lossily rather than aborting the scan.
            out.push(p.to_string_lossy().to_string());
        }
        // Reversed so the stack pops them in name order.
        stack.extend(subdirs.into_iter().rev().map(|p| (p, depth + 1)));
    }

    Ok(out)
}

fn is_video(p: &Path) -> bool {
    let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str())
}

/// Files in `found` that are not in `current`, in `found` order, without repeats.
pub fn new_files(current: &[String], found: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = current.iter().cloned().collect();
    found.into_iter().filter(|f| seen.insert(f.clone())).collect()
}

/// Runs `Engine::sweep_folder_watches` on the configured interval.
pub fn spawn_poller(engine: Engine) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = engine.config().watch_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            engine.sweep_folder_watches().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, rel: &str) {
        let p = dir.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"").unwrap();
    }

    fn rel(root: &Path, files: &[String]) -> Vec<String> {
        files
            .iter()
            .map(|f| Path::new(f).strip_prefix(root).unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn filters_by_extension_and_respects_recursion() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["b.mp4", "a.MKV", "notes.txt", "cover.jpg", "sub/c.mov", "sub/deeper/d.webm"] {
            touch(dir.path(), f);
        }

        let flat = scan_video_files(dir.path(), false, 16).unwrap();
        assert_eq!(rel(dir.path(), &flat), ["a.MKV", "b.mp4"]);

        let deep = scan_video_files(dir.path(), true, 16).unwrap();
        assert_eq!(rel(dir.path(), &deep), ["a.MKV", "b.mp4", "sub/c.mov", "sub/deeper/d.webm"]);

        let shallow = scan_video_files(dir.path(), true, 1).unwrap();
        assert_eq!(rel(dir.path(), &shallow), ["a.MKV", "b.mp4", "sub/c.mov"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_video_files(&dir.path().join("gone"), true, 4).unwrap_err();
        assert!(matches!(err, EngineError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn new_files_is_an_ordered_set_difference() {
        let current = vec!["/m/a.mp4".to_string(), "/m/b.mp4".to_string()];
        let found = vec!["/m/c.mp4".into(), "/m/a.mp4".into(), "/m/d.mp4".into(), "/m/c.mp4".into()];
        assert_eq!(new_files(&current, found), ["/m/c.mp4", "/m/d.mp4"]);
        assert!(new_files(&current, current.clone()).is_empty());
    }
}
