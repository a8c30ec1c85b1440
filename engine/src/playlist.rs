use std::collections::VecDeque;

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::{
    error::{EngineError, EngineResult},
    ffmpeg::Redactor,
    options::EncodeOptions,
    shuffle::{self, ShuffleMode},
};

pub const DEFAULT_RECENCY_WINDOW: usize = 5;

// --- Playlist -----------------------------------------------------------------
//
// A playlist is pure data plus the ordering operations on it. The engine owns
// the table of playlists and is responsible for locking and for publishing an
// event after each mutation; nothing in here does I/O.

#[derive(Clone, Debug, Serialize)]
pub struct Playlist {
    pub id: Uuid,
    pub name: String,
    pub files: Vec<String>,
    /// Index of the file that is (or will be) streaming.
    pub current_index: usize,
    pub shuffle_mode: ShuffleMode,
    pub recency_window: usize,
    /// Recently played files, oldest first.
    pub history: VecDeque<String>,
    pub auto_loop: bool,
    pub streaming: bool,
    pub seamless: bool,
    /// Snapshots go out in events and API responses, so the stream key is masked.
    #[serde(serialize_with = "serialize_redacted")]
    pub destination: Option<String>,
    pub options: Option<EncodeOptions>,
    pub current_job: Option<Uuid>,
    /// Unix millis.
    pub created_at_ms: u64,
}

/// Partial update. Absent fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PlaylistPatch {
    pub name: Option<String>,
    pub files: Option<Vec<String>>,
    pub auto_loop: Option<bool>,
    pub shuffle_mode: Option<ShuffleMode>,
    pub recency_window: Option<usize>,
}

fn serialize_redacted<S: Serializer>(destination: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    destination
        .as_deref()
        .map(|d| Redactor::for_destination(d).apply(d))
        .serialize(s)
}

impl Playlist {
    pub fn new(name: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            files,
            current_index: 0,
            shuffle_mode: ShuffleMode::None,
            recency_window: DEFAULT_RECENCY_WINDOW,
            history: VecDeque::new(),
            auto_loop: false,
            streaming: false,
            seamless: false,
            destination: None,
            options: None,
            current_job: None,
            created_at_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    pub fn current_file(&self) -> Option<&str> {
        self.files.get(self.current_index).map(String::as_str)
    }

    pub fn add_file(&mut self, path: impl Into<String>) {
        self.files.push(path.into());
    }

    /// Removes the file at `index` and returns it.
    pub fn remove_at(&mut self, index: usize) -> EngineResult<String> {
        if index >= self.files.len() {
            return Err(EngineError::validation(format!(
                "index {index} out of range (playlist has {} files)",
                self.files.len()
            )));
        }
        let removed = self.files.remove(index);
        self.clamp_cursor();
        Ok(removed)
    }

    /// Moves one file from `from` to `to`, shifting the files in between.
    pub fn move_item(&mut self, from: usize, to: usize) -> EngineResult<()> {
        let len = self.files.len();
        if from >= len || to >= len {
            return Err(EngineError::validation(format!(
                "move {from} -> {to} out of range (playlist has {len} files)"
            )));
        }
        if from == to {
            return Ok(());
        }
        let item = self.files.remove(from);
        self.files.insert(to, item);
        Ok(())
    }

    /// Adopts a new shuffle configuration and reorders with it.
    pub fn shuffle(&mut self, mode: ShuffleMode, window: usize, rng: &mut fastrand::Rng) {
        self.shuffle_mode = mode;
        self.recency_window = window;
        shuffle::trim_history(&mut self.history, window);
        self.reshuffle(rng);
    }

    /// Reorders with the configured mode and rewinds.
    pub fn reshuffle(&mut self, rng: &mut fastrand::Rng) {
        shuffle::shuffle_files(self.shuffle_mode, &mut self.files, &mut self.history, rng);
        self.current_index = 0;
    }

    pub fn record_played(&mut self, file: &str) {
        shuffle::record_played(&mut self.history, file, self.recency_window);
    }

    pub fn apply(&mut self, patch: PlaylistPatch) -> EngineResult<()> {
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(EngineError::validation("playlist name must not be empty"));
            }
        }
        if let Some(name) = patch.name {
            self.name = name.trim().to_string();
        }
        if let Some(files) = patch.files {
            self.files = files;
            self.clamp_cursor();
        }
        if let Some(auto_loop) = patch.auto_loop {
            self.auto_loop = auto_loop;
        }
        if let Some(mode) = patch.shuffle_mode {
            self.shuffle_mode = mode;
        }
        if let Some(window) = patch.recency_window {
            self.recency_window = window;
            shuffle::trim_history(&mut self.history, window);
        }
        Ok(())
    }

    /// Streaming is over; forget the job binding but keep the cursor.
    pub fn mark_idle(&mut self) {
        self.streaming = false;
        self.current_job = None;
    }

    /// Ran off the end without looping.
    pub fn mark_completed(&mut self) {
        self.mark_idle();
        self.current_index = 0;
    }

    fn clamp_cursor(&mut self) {
        if self.current_index >= self.files.len() {
            self.current_index = self.files.len().saturating_sub(1);
        }
    }
}
