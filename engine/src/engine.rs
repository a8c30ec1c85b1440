use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Weak},
};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    events::{EngineEvent, EventBus},
    folder_watch::{self, FolderWatch},
    jobs::{JobController, JobExit, JobOutcome, JobRequest, JobSource, JobSummary},
    options::{self, EncodeOptions},
    playlist::{Playlist, PlaylistPatch},
    shuffle::ShuffleMode,
};

// --- Engine -----------------------------------------------------------------------
//
// The engine owns the playlist and folder-watch tables and the job controller.
// Every operation the HTTP layer exposes is a method here.
//
// Locking rules:
//   - The playlist table lock is held for the whole read-modify-publish of a
//     mutation, so "updated" events go out in mutation order.
//   - It is never held across a job start/stop (those can take seconds).
//   - The playlist and watch tables are never locked at the same time.
//
// At most one job per playlist: `start_playlist` reserves the playlist
// (streaming + current_job) under the lock before spawning anything, and only
// advancement starts a job for a playlist that is already streaming.

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<EngineConfig>,
    bus: EventBus,
    jobs: JobController,
    playlists: Mutex<HashMap<Uuid, Playlist>>,
    watches: Mutex<HashMap<Uuid, FolderWatch>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlaylistStart {
    pub playlist_id: Uuid,
    pub job_id: Uuid,
}

impl Engine {
    /// Must be called inside a tokio runtime: spawns the advancement task.
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::new(1024);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let jobs = JobController::new(config.clone(), bus.clone(), exit_tx);

        let inner = Arc::new(Inner {
            config,
            bus,
            jobs,
            playlists: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        });
        tokio::spawn(handle_exits(Arc::downgrade(&inner), exit_rx));
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        self.inner.bus.publish(event);
    }

    // --- Ad hoc streams ------------------------------------------------------------

    pub async fn start_stream(&self, file_path: &str, destination: &str, options: EncodeOptions) -> EngineResult<Uuid> {
        let req = JobRequest::new(JobSource::File(file_path.trim().to_string()), destination, options);
        self.inner.jobs.start(req).await
    }

    pub async fn stop_stream(&self, job_id: Uuid) -> EngineResult<()> {
        self.inner.jobs.stop(job_id).await
    }

    pub async fn list_active_jobs(&self) -> Vec<JobSummary> {
        self.inner.jobs.list().await
    }

    // --- Playlist CRUD ---------------------------------------------------------------

    pub async fn create_playlist(&self, name: &str, files: Vec<String>) -> EngineResult<Playlist> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("playlist name is required"));
        }
        let playlist = Playlist::new(name, files);
        let mut table = self.inner.playlists.lock().await;
        table.insert(playlist.id, playlist.clone());
        self.publish(EngineEvent::PlaylistUpdated {
            playlist: playlist.clone(),
        });
        info!("playlist {} created: {} ({} files)", playlist.id, playlist.name, playlist.files.len());
        Ok(playlist)
    }

    pub async fn get_playlist(&self, id: Uuid) -> EngineResult<Playlist> {
        self.inner
            .playlists
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::playlist_not_found(id))
    }

    pub async fn list_playlists(&self) -> Vec<Playlist> {
        let mut all: Vec<Playlist> = self.inner.playlists.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub async fn update_playlist(&self, id: Uuid, patch: PlaylistPatch) -> EngineResult<Playlist> {
        self.mutate(id, |p| p.apply(patch)).await
    }

    /// Stops the playlist's job (if any) and forgets the playlist. Its folder
    /// watch is pruned on the next sweep.
    pub async fn delete_playlist(&self, id: Uuid) -> EngineResult<()> {
        self.stop_playlist(id).await?;
        let removed = self.inner.playlists.lock().await.remove(&id);
        match removed {
            Some(p) => {
                info!("playlist {id} deleted: {}", p.name);
                Ok(())
            }
            None => Err(EngineError::playlist_not_found(id)),
        }
    }

    // --- Ordering -------------------------------------------------------------------

    pub async fn add_file(&self, id: Uuid, path: &str) -> EngineResult<Playlist> {
        let path = path.trim();
        if path.is_empty() {
            return Err(EngineError::validation("file path is required"));
        }
        self.mutate(id, |p| {
            p.add_file(path);
            Ok(())
        })
        .await
    }

    pub async fn remove_file_at(&self, id: Uuid, index: usize) -> EngineResult<Playlist> {
        self.mutate(id, |p| p.remove_at(index).map(drop)).await
    }

    pub async fn reorder(&self, id: Uuid, from: usize, to: usize) -> EngineResult<Playlist> {
        self.mutate(id, |p| p.move_item(from, to)).await
    }

    /// Adopts `mode` (and `window`, if given) and reorders the playlist now.
    pub async fn shuffle(&self, id: Uuid, mode: ShuffleMode, window: Option<usize>) -> EngineResult<Playlist> {
        let mut table = self.inner.playlists.lock().await;
        let p = table.get_mut(&id).ok_or_else(|| EngineError::playlist_not_found(id))?;
        let window = window.unwrap_or(p.recency_window);
        p.shuffle(mode, window, &mut fastrand::Rng::new());
        let snapshot = p.clone();
        self.publish(EngineEvent::PlaylistShuffled {
            playlist: snapshot.clone(),
        });
        self.publish(EngineEvent::PlaylistUpdated {
            playlist: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Applies `f` and publishes the result. On error nothing is published.
    async fn mutate(&self, id: Uuid, f: impl FnOnce(&mut Playlist) -> EngineResult<()>) -> EngineResult<Playlist> {
        let mut table = self.inner.playlists.lock().await;
        let p = table.get_mut(&id).ok_or_else(|| EngineError::playlist_not_found(id))?;
        f(p)?;
        let snapshot = p.clone();
        self.publish(EngineEvent::PlaylistUpdated {
            playlist: snapshot.clone(),
        });
        Ok(snapshot)
    }

    // --- Playlist streaming ------------------------------------------------------------

    pub async fn start_playlist(
        &self,
        id: Uuid,
        destination: &str,
        options: EncodeOptions,
        seamless: bool,
    ) -> EngineResult<PlaylistStart> {
        let destination = options::validate_destination(destination)?;
        options.validate()?;

        let (req, index) = {
            let mut table = self.inner.playlists.lock().await;
            let p = table.get_mut(&id).ok_or_else(|| EngineError::playlist_not_found(id))?;
            if p.files.is_empty() {
                return Err(EngineError::validation(format!("playlist {:?} is empty", p.name)));
            }
            if p.streaming {
                return Err(EngineError::Conflict(format!("playlist {:?} is already streaming", p.name)));
            }
            let Some(current) = p.current_file().map(str::to_string) else {
                return Err(EngineError::validation("playlist cursor is out of range"));
            };

            let source = if seamless {
                JobSource::List(p.files[p.current_index..].to_vec())
            } else {
                JobSource::File(current)
            };
            let req = JobRequest::new(source, destination.clone(), options.clone()).for_playlist(id, p.name.clone());

            p.streaming = true;
            p.seamless = seamless;
            p.destination = Some(destination);
            p.options = Some(options);
            p.current_job = Some(req.id);
            for f in req.source.files() {
                p.record_played(f);
            }
            self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
            (req, p.current_index)
        };

        let job_id = req.id;
        match self.inner.jobs.start(req).await {
            Ok(_) => {
                if !self.confirm_start(id, job_id).await {
                    // Stopped while we were waiting for ffmpeg.
                    let _ = self.inner.jobs.stop(job_id).await;
                    return Err(EngineError::Conflict("playlist was stopped while starting".into()));
                }
                self.publish(EngineEvent::PlaylistStarted {
                    playlist_id: id,
                    job_id,
                    index,
                });
                info!("playlist {id} streaming from index {index} (job {job_id})");
                Ok(PlaylistStart { playlist_id: id, job_id })
            }
            Err(e) => {
                self.release_failed_start(id, job_id).await;
                Err(e)
            }
        }
    }

    /// Stops whatever the playlist is streaming. Idempotent.
    pub async fn stop_playlist(&self, id: Uuid) -> EngineResult<()> {
        let job = {
            let mut table = self.inner.playlists.lock().await;
            let p = table.get_mut(&id).ok_or_else(|| EngineError::playlist_not_found(id))?;
            let job = p.current_job;
            if p.streaming || job.is_some() {
                // Unbind first so the job's exit is not taken for a natural end.
                p.mark_idle();
                self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
            }
            job
        };

        if let Some(job_id) = job {
            match self.inner.jobs.stop(job_id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            info!("playlist {id} stopped (job {job_id})");
        }
        Ok(())
    }

    /// After a successful start: false if the playlist let go of `job_id`
    /// while it was starting and the job is still running unowned.
    ///
    /// A job that already left the registry has exited and its exit drives the
    /// playlist, so that counts as confirmed.
    async fn confirm_start(&self, id: Uuid, job_id: Uuid) -> bool {
        let bound = matches!(
            self.inner.playlists.lock().await.get(&id),
            Some(p) if p.streaming && p.current_job == Some(job_id)
        );
        bound || !self.inner.jobs.registry().contains(job_id).await
    }

    async fn release_failed_start(&self, id: Uuid, job_id: Uuid) {
        let mut table = self.inner.playlists.lock().await;
        if let Some(p) = table.get_mut(&id) {
            if p.current_job == Some(job_id) {
                p.mark_idle();
                self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
            }
        }
    }

    // --- Advancement -------------------------------------------------------------------

    async fn on_job_exit(&self, exit: JobExit) {
        let Some(playlist_id) = exit.playlist_id else {
            return;
        };
        match &exit.outcome {
            JobOutcome::Ended => self.advance(playlist_id, exit.job_id).await,
            JobOutcome::Errored { message, .. } => {
                warn!("playlist {playlist_id}: {} failed: {message}", exit.source.files().join(", "));
                self.release_failed_start(playlist_id, exit.job_id).await
            }
            // stop_playlist already unbound it.
            JobOutcome::Stopped => {}
        }
    }

    async fn advance(&self, id: Uuid, ended_job: Uuid) {
        let next = {
            let mut table = self.inner.playlists.lock().await;
            let Some(p) = table.get_mut(&id) else {
                return;
            };
            // A stale exit: stopped, restarted, or already advanced past.
            if !p.streaming || p.current_job != Some(ended_job) {
                return;
            }

            let Some(destination) = p.destination.clone() else {
                warn!("playlist {id}: streaming without a destination; marking idle");
                p.mark_idle();
                self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
                return;
            };

            let next_index = p.current_index + 1;
            let wrapped = p.seamless || next_index >= p.files.len();
            if wrapped && (!p.auto_loop || p.files.is_empty()) {
                p.mark_completed();
                info!("playlist {id} completed");
                self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
                self.publish(EngineEvent::PlaylistCompleted { playlist_id: id });
                return;
            }
            if wrapped {
                p.reshuffle(&mut fastrand::Rng::new());
                info!("playlist {id} looping ({:?} shuffle)", p.shuffle_mode);
                self.publish(EngineEvent::PlaylistShuffled { playlist: p.clone() });
            } else {
                p.current_index = next_index;
            }

            let source = if p.seamless {
                JobSource::List(p.files.clone())
            } else {
                JobSource::File(p.files[p.current_index].clone())
            };
            let options = p.options.clone().unwrap_or_default().without_seek();
            let req = JobRequest::new(source, destination, options).for_playlist(id, p.name.clone());
            p.current_job = Some(req.id);
            for f in req.source.files() {
                p.record_played(f);
            }
            self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
            (req, p.current_index)
        };

        let (req, index) = next;
        let job_id = req.id;
        let source = req.source.clone();
        match self.inner.jobs.start(req).await {
            Ok(_) => {
                if !self.confirm_start(id, job_id).await {
                    let _ = self.inner.jobs.stop(job_id).await;
                    return;
                }
                let file = source.files().first().map(|f| f.to_string()).unwrap_or_default();
                self.publish(EngineEvent::PlaylistNext {
                    playlist_id: id,
                    job_id,
                    index,
                    file,
                });
            }
            Err(e) => {
                warn!("playlist {id}: failed to start item {index}: {e}");
                // Process failures were already reported by the job itself.
                if !matches!(e, EngineError::Process { .. }) {
                    self.publish(EngineEvent::JobError {
                        job_id,
                        playlist_id: Some(id),
                        message: e.to_string(),
                        diagnostics: None,
                    });
                }
                self.release_failed_start(id, job_id).await;
            }
        }
    }

    // --- Folder watches ---------------------------------------------------------------

    pub async fn enable_folder_watch(&self, id: Uuid, dir: &str, recursive: bool) -> EngineResult<FolderWatch> {
        self.get_playlist(id).await?;
        let dir = PathBuf::from(dir.trim());
        if dir.as_os_str().is_empty() || !dir.is_dir() {
            return Err(EngineError::validation(format!("{} is not a directory", dir.display())));
        }

        let watch = FolderWatch {
            playlist_id: id,
            dir,
            recursive,
            last_checked_ms: None,
        };
        self.inner.watches.lock().await.insert(id, watch.clone());
        info!("folder watch enabled for playlist {id}: {}", watch.dir.display());

        self.sweep_one(&watch).await?;
        Ok(self.inner.watches.lock().await.get(&id).cloned().unwrap_or(watch))
    }

    pub async fn disable_folder_watch(&self, id: Uuid) -> EngineResult<()> {
        match self.inner.watches.lock().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("folder watch for playlist {id}"))),
        }
    }

    pub async fn list_folder_watches(&self) -> Vec<FolderWatch> {
        self.inner.watches.lock().await.values().cloned().collect()
    }

    /// One poller tick: rescan every watch, pruning those whose playlist is gone.
    pub async fn sweep_folder_watches(&self) {
        let watches = self.list_folder_watches().await;
        for w in watches {
            if let Err(e) = self.sweep_one(&w).await {
                warn!("folder watch {} for playlist {}: {e}", w.dir.display(), w.playlist_id);
                self.publish(EngineEvent::WatchError {
                    playlist_id: w.playlist_id,
                    dir: w.dir.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Returns the files appended to the playlist.
    async fn sweep_one(&self, watch: &FolderWatch) -> EngineResult<Vec<String>> {
        let id = watch.playlist_id;
        if !self.inner.playlists.lock().await.contains_key(&id) {
            self.prune_watch(id).await;
            return Ok(Vec::new());
        }

        let dir = watch.dir.clone();
        let recursive = watch.recursive;
        let max_depth = self.inner.config.watch_max_depth;
        let found = tokio::task::spawn_blocking(move || folder_watch::scan_video_files(&dir, recursive, max_depth))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

        if let Some(w) = self.inner.watches.lock().await.get_mut(&id) {
            w.last_checked_ms = Some(unix_millis());
        }
        let found = found?;

        let added = {
            let mut table = self.inner.playlists.lock().await;
            table.get_mut(&id).map(|p| {
                let added = folder_watch::new_files(&p.files, found);
                if !added.is_empty() {
                    p.files.extend(added.iter().cloned());
                    self.publish(EngineEvent::PlaylistUpdated { playlist: p.clone() });
                    self.publish(EngineEvent::PlaylistNewFilesDiscovered {
                        playlist_id: id,
                        files: added.clone(),
                    });
                }
                added
            })
        };
        let Some(added) = added else {
            // Deleted while we were scanning.
            self.prune_watch(id).await;
            return Ok(Vec::new());
        };
        if !added.is_empty() {
            info!("folder watch added {} file(s) to playlist {id}", added.len());
        }
        Ok(added)
    }

    async fn prune_watch(&self, id: Uuid) {
        if self.inner.watches.lock().await.remove(&id).is_some() {
            info!("folder watch pruned: playlist {id} no longer exists");
        }
    }

    /// Creates a playlist from the video files found under `dir`.
    pub async fn import_folder(&self, dir: &str, recursive: bool, name: Option<&str>) -> EngineResult<Playlist> {
        let path = PathBuf::from(dir.trim());
        if path.as_os_str().is_empty() || !path.is_dir() {
            return Err(EngineError::validation(format!("{} is not a directory", path.display())));
        }
        let max_depth = self.inner.config.watch_max_depth;
        let scan_path = path.clone();
        let files = tokio::task::spawn_blocking(move || folder_watch::scan_video_files(&scan_path, recursive, max_depth))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        if files.is_empty() {
            return Err(EngineError::validation(format!("no video files found in {}", path.display())));
        }

        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
        };
        self.create_playlist(&name, files).await
    }

    // --- Shutdown ---------------------------------------------------------------------

    /// Unbinds every playlist and stops every job. Used on process shutdown.
    pub async fn shutdown(&self) {
        {
            let mut table = self.inner.playlists.lock().await;
            for p in table.values_mut() {
                p.mark_idle();
            }
        }
        let jobs = self.inner.jobs.list().await;
        for job in jobs {
            if let Err(e) = self.inner.jobs.stop(job.id).await {
                warn!("shutdown: stopping job {}: {e}", job.id);
            }
        }
    }
}

async fn handle_exits(inner: Weak<Inner>, mut exits: mpsc::UnboundedReceiver<JobExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine { inner };
        // Each exit on its own task: starting the next job waits on ffmpeg,
        // and other playlists must not queue behind it.
        tokio::spawn(async move { engine.on_job_exit(exit).await });
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
