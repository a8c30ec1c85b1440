use std::{collections::HashMap, path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};

use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Child,
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    events::{EndReason, EngineEvent, EventBus},
    ffmpeg::{self, Input, ProgressParser, Redactor, Spawned, StderrTail},
    options::{self, EncodeOptions},
};

// --- Jobs -----------------------------------------------------------------------
//
// A job is one supervised ffmpeg process pushing to one destination. Each job
// gets its own supervisor task which owns the Child and drives the state
// machine:
//
//   starting -> running -> ended | errored | stopped
//
// The supervisor is the only writer of a job's terminal state. When it
// finishes it removes the job from the registry and reports a `JobExit` on
// the exits channel; playlist advancement consumes those.

#[derive(Clone, Debug)]
pub enum JobSource {
    File(String),
    /// Played back to back from a concat manifest ("seamless").
    List(Vec<String>),
}

impl JobSource {
    pub fn files(&self) -> Vec<&str> {
        match self {
            Self::File(f) => vec![f.as_str()],
            Self::List(fs) => fs.iter().map(String::as_str).collect(),
        }
    }

    fn default_label(&self) -> String {
        match self {
            Self::File(f) => options::display_name(f),
            Self::List(fs) => format!("{} files (seamless)", fs.len()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Running,
    Ended,
    Errored,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub label: String,
    pub source: JobSource,
    pub destination: String,
    pub options: EncodeOptions,
    pub state: JobState,
    pub started_at: OffsetDateTime,
    pub playlist_id: Option<Uuid>,
}

/// What `listActiveJobs` returns. The destination is redacted.
#[derive(Clone, Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub display_name: String,
    pub destination_uri: String,
    pub started_at: String,
    pub status: JobState,
    pub playlist_id: Option<Uuid>,
    pub files: Vec<String>,
    pub options: EncodeOptions,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            display_name: job.label.clone(),
            destination_uri: Redactor::for_destination(&job.destination).apply(&job.destination),
            started_at: job.started_at.format(&Rfc3339).unwrap_or_default(),
            status: job.state,
            playlist_id: job.playlist_id,
            files: job.source.files().into_iter().map(String::from).collect(),
            options: job.options.clone(),
        }
    }
}

/// Everything needed to start a job. The id is allocated up front so callers
/// can bind it (e.g. to a playlist) before the process exists.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub id: Uuid,
    pub source: JobSource,
    pub destination: String,
    pub options: EncodeOptions,
    pub playlist_id: Option<Uuid>,
    pub label: Option<String>,
}

impl JobRequest {
    pub fn new(source: JobSource, destination: impl Into<String>, options: EncodeOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination: destination.into(),
            options,
            playlist_id: None,
            label: None,
        }
    }

    pub fn for_playlist(mut self, playlist_id: Uuid, label: impl Into<String>) -> Self {
        self.playlist_id = Some(playlist_id);
        self.label = Some(label.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Ended,
    Errored {
        message: String,
        diagnostics: Option<String>,
    },
    Stopped,
}

#[derive(Clone, Debug)]
pub struct JobExit {
    pub job_id: Uuid,
    pub playlist_id: Option<Uuid>,
    pub source: JobSource,
    pub outcome: JobOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    Requested,
    StartTimeout,
}

struct StopRequest {
    reason: StopReason,
    ack: oneshot::Sender<()>,
}

// --- Registry ---------------------------------------------------------------------

struct JobEntry {
    job: Job,
    stop_tx: mpsc::Sender<StopRequest>,
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    async fn insert(&self, entry: JobEntry) {
        self.jobs.lock().await.insert(entry.job.id, entry);
    }

    async fn remove(&self, id: Uuid) {
        self.jobs.lock().await.remove(&id);
    }

    async fn set_state(&self, id: Uuid, state: JobState) {
        if let Some(entry) = self.jobs.lock().await.get_mut(&id) {
            entry.job.state = state;
        }
    }

    async fn stop_handle(&self, id: Uuid) -> Option<mpsc::Sender<StopRequest>> {
        self.jobs.lock().await.get(&id).map(|e| e.stop_tx.clone())
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.jobs.lock().await.contains_key(&id)
    }

    #[cfg(test)]
    pub async fn jobs_for_playlist(&self, playlist_id: Uuid) -> Vec<Uuid> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|e| e.job.playlist_id == Some(playlist_id))
            .map(|e| e.job.id)
            .collect()
    }

    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }
}

// --- Controller -------------------------------------------------------------------

#[derive(Clone)]
pub struct JobController {
    config: Arc<EngineConfig>,
    registry: JobRegistry,
    bus: EventBus,
    exits: mpsc::UnboundedSender<JobExit>,
}

impl JobController {
    pub fn new(config: Arc<EngineConfig>, bus: EventBus, exits: mpsc::UnboundedSender<JobExit>) -> Self {
        Self {
            config,
            registry: JobRegistry::default(),
            bus,
            exits,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Spawns ffmpeg for `req` and waits until it reports that output is flowing.
    pub async fn start(&self, req: JobRequest) -> EngineResult<Uuid> {
        let destination = options::validate_destination(&req.destination)?;
        let resolution = req.options.validate()?;
        check_sources(&req.source).await?;

        let id = req.id;
        let seek = options::resolve_seek(req.options.seek.as_deref());
        let redact = Redactor::for_destination(&destination);

        let (manifest, args) = match &req.source {
            JobSource::File(path) => {
                let input = Input::File {
                    path,
                    seek,
                    loop_file: req.options.loop_file && req.playlist_id.is_none(),
                };
                (None, ffmpeg::build_args(&input, &req.options, resolution, &destination))
            }
            JobSource::List(files) => {
                let path = ffmpeg::write_manifest(&self.config.manifest_dir, id, files).await?;
                let input = Input::Manifest { path: &path, seek };
                let args = ffmpeg::build_args(&input, &req.options, resolution, &destination);
                (Some(path), args)
            }
        };

        let spawned = match ffmpeg::spawn(&self.config.ffmpeg, &args, &redact) {
            Ok(s) => s,
            Err(e) => {
                if let Some(m) = &manifest {
                    ffmpeg::remove_manifest(m).await;
                }
                self.bus.publish(EngineEvent::JobError {
                    job_id: id,
                    playlist_id: req.playlist_id,
                    message: e.to_string(),
                    diagnostics: None,
                });
                return Err(e);
            }
        };

        let label = req.label.clone().unwrap_or_else(|| req.source.default_label());
        let job = Job {
            id,
            label: label.clone(),
            source: req.source.clone(),
            destination: destination.clone(),
            options: req.options.clone(),
            state: JobState::Starting,
            started_at: OffsetDateTime::now_utc(),
            playlist_id: req.playlist_id,
        };

        let (stop_tx, stop_rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = oneshot::channel();
        self.registry.insert(JobEntry { job, stop_tx }).await;
        info!("job {id} starting: {label} -> {}", redact.apply(&destination));

        let supervisor = Supervisor {
            job_id: id,
            playlist_id: req.playlist_id,
            label,
            destination,
            source: req.source,
            manifest,
            redact,
            stop_grace: self.config.stop_grace,
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            exits: self.exits.clone(),
        };
        tokio::spawn(supervisor.run(spawned, stop_rx, ready_tx));

        let ready = match self.config.start_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(r) => r,
                Err(_) => {
                    warn!("job {id}: ffmpeg did not confirm output within {limit:?}; killing it");
                    self.request_stop(id, StopReason::StartTimeout).await;
                    return Err(EngineError::process(
                        format!("ffmpeg did not start streaming within {}s", limit.as_secs()),
                        None,
                    ));
                }
            },
            None => ready_rx.await,
        };

        match ready {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::process("job supervisor exited unexpectedly", None)),
        }
    }

    /// Stops a job: SIGTERM, then SIGKILL after the grace period. Resolves once
    /// the job has left the registry.
    pub async fn stop(&self, id: Uuid) -> EngineResult<()> {
        if !self.registry.contains(id).await {
            return Err(EngineError::job_not_found(id));
        }
        self.request_stop(id, StopReason::Requested).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        self.registry.list().await.iter().map(JobSummary::from).collect()
    }

    async fn request_stop(&self, id: Uuid, reason: StopReason) {
        let Some(tx) = self.registry.stop_handle(id).await else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(StopRequest { reason, ack }).await.is_err() {
            // Supervisor is already on its way out.
            return;
        }
        let _ = done.await;
    }
}

async fn check_sources(source: &JobSource) -> EngineResult<()> {
    let files = source.files();
    if files.is_empty() {
        return Err(EngineError::validation("nothing to stream"));
    }
    for f in files {
        if f.trim().is_empty() {
            return Err(EngineError::validation("file path is required"));
        }
        match tokio::fs::metadata(f).await {
            Ok(m) if m.is_file() => {}
            Ok(_) => return Err(EngineError::validation(format!("{f} is not a file"))),
            Err(_) => return Err(EngineError::validation(format!("{f} does not exist"))),
        }
    }
    Ok(())
}

// --- Supervisor ---------------------------------------------------------------------

struct Supervisor {
    job_id: Uuid,
    playlist_id: Option<Uuid>,
    label: String,
    destination: String,
    source: JobSource,
    manifest: Option<PathBuf>,
    redact: Redactor,
    stop_grace: Duration,
    registry: JobRegistry,
    bus: EventBus,
    exits: mpsc::UnboundedSender<JobExit>,
}

impl Supervisor {
    async fn run(
        self,
        spawned: Spawned,
        mut stop_rx: mpsc::Receiver<StopRequest>,
        ready_tx: oneshot::Sender<EngineResult<()>>,
    ) {
        let Spawned { mut child, stdout, stderr } = spawned;
        // Dropped on EOF or read error so ffmpeg can never block on a pipe nobody drains.
        let mut stdout = Some(BufReader::new(stdout));
        let mut stderr = Some(BufReader::new(stderr));
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());

        let mut progress = ProgressParser::default();
        let mut tail = StderrTail::new();
        let mut state = JobState::Starting;
        let mut ready = Some(ready_tx);
        let mut stop: Option<StopRequest> = None;

        let exit = loop {
            tokio::select! {
                read = next_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                    let eof = self.end_of_pipe(&read, "stdout");
                    if !out_buf.is_empty() {
                        let line = take_line(&mut out_buf);
                        if let Some(report) = progress.feed(&line) {
                            if state == JobState::Starting {
                                state = self.mark_running(&mut ready).await;
                            }
                            self.bus.publish(EngineEvent::JobProgress {
                                job_id: self.job_id,
                                playlist_id: self.playlist_id,
                                progress: report,
                            });
                        }
                    }
                    if eof {
                        stdout = None;
                    }
                },
                read = next_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                    let eof = self.end_of_pipe(&read, "stderr");
                    if !err_buf.is_empty() {
                        let line = self.redact.apply(&take_line(&mut err_buf));
                        if state == JobState::Starting && ffmpeg::is_output_opened(&line) {
                            state = self.mark_running(&mut ready).await;
                        }
                        if !line.trim().is_empty() {
                            tail.push(line);
                        }
                    }
                    if eof {
                        stderr = None;
                    }
                },
                Some(req) = stop_rx.recv() => {
                    let grace = match req.reason {
                        StopReason::Requested => self.stop_grace,
                        StopReason::StartTimeout => Duration::ZERO,
                    };
                    let status = terminate(&mut child, grace).await;
                    stop = Some(req);
                    break status;
                },
                status = child.wait() => break status,
            }
        };

        // ffmpeg writes its real complaint right before exiting; pick up what's left.
        if let Some(mut reader) = stderr.take() {
            loop {
                let read = tokio::time::timeout(Duration::from_millis(250), reader.read_until(b'\n', &mut err_buf)).await;
                let done = !matches!(read, Ok(Ok(n)) if n > 0);
                if done || err_buf.ends_with(b"\n") {
                    let line = self.redact.apply(&take_line(&mut err_buf));
                    if !line.trim().is_empty() {
                        tail.push(line);
                    }
                }
                if done {
                    break;
                }
            }
        }

        let outcome = classify(stop.as_ref().map(|s| s.reason), &exit, &tail);
        if outcome == JobOutcome::Ended && state == JobState::Starting {
            // Short input: finished before the first progress report.
            self.mark_running(&mut ready).await;
        }

        self.registry.remove(self.job_id).await;
        if let Some(m) = &self.manifest {
            ffmpeg::remove_manifest(m).await;
        }

        match &outcome {
            JobOutcome::Ended => {
                info!("job {} ended: {}", self.job_id, self.label);
                self.bus.publish(EngineEvent::JobEnded {
                    job_id: self.job_id,
                    playlist_id: self.playlist_id,
                    reason: EndReason::Completed,
                });
            }
            JobOutcome::Stopped => {
                info!("job {} stopped: {}", self.job_id, self.label);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(EngineError::process("job was stopped before it started streaming", None)));
                }
                self.bus.publish(EngineEvent::JobEnded {
                    job_id: self.job_id,
                    playlist_id: self.playlist_id,
                    reason: EndReason::Stopped,
                });
            }
            JobOutcome::Errored { message, diagnostics } => {
                warn!(
                    "job {} failed ({} -> {}): {message}; {}",
                    self.job_id,
                    self.label,
                    self.redact.apply(&self.destination),
                    diagnostics.as_deref().unwrap_or("no diagnostics")
                );
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(EngineError::process(message.clone(), diagnostics.clone())));
                }
                self.bus.publish(EngineEvent::JobError {
                    job_id: self.job_id,
                    playlist_id: self.playlist_id,
                    message: message.clone(),
                    diagnostics: diagnostics.clone(),
                });
            }
        }

        let _ = self.exits.send(JobExit {
            job_id: self.job_id,
            playlist_id: self.playlist_id,
            source: self.source.clone(),
            outcome,
        });

        if let Some(req) = stop {
            let _ = req.ack.send(());
        }
    }

    /// True when `read` means the pipe is finished: EOF, or an I/O error.
    fn end_of_pipe(&self, read: &std::io::Result<usize>, pipe: &str) -> bool {
        match read {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => {
                warn!("job {}: reading ffmpeg {pipe} failed: {e}", self.job_id);
                true
            }
        }
    }

    async fn mark_running(&self, ready: &mut Option<oneshot::Sender<EngineResult<()>>>) -> JobState {
        self.registry.set_state(self.job_id, JobState::Running).await;
        info!("job {} running: {}", self.job_id, self.label);
        self.bus.publish(EngineEvent::JobStarted {
            job_id: self.job_id,
            playlist_id: self.playlist_id,
            display_name: self.label.clone(),
            destination: self.redact.apply(&self.destination),
        });
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }
        JobState::Running
    }
}

/// Reads up to and including the next newline. Pending forever once the reader is gone.
///
/// `read_until` keeps partial input in `buf` if the select drops it, so no bytes are lost.
async fn next_chunk<R: AsyncBufRead + Unpin>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read_until(b'\n', buf).await,
        None => std::future::pending().await,
    }
}

/// ffmpeg echoes paths and metadata in whatever encoding they are in.
fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).trim_end_matches(['\n', '\r']).to_string();
    buf.clear();
    line
}

fn classify(stop: Option<StopReason>, exit: &std::io::Result<ExitStatus>, tail: &StderrTail) -> JobOutcome {
    match (stop, exit) {
        (Some(StopReason::Requested), _) => JobOutcome::Stopped,
        (Some(StopReason::StartTimeout), _) => JobOutcome::Errored {
            message: "timed out waiting for ffmpeg to start streaming".into(),
            diagnostics: tail.summary(),
        },
        (None, Ok(status)) if status.success() => JobOutcome::Ended,
        (None, Ok(status)) => JobOutcome::Errored {
            message: format!("ffmpeg exited: {status}"),
            diagnostics: tail.summary(),
        },
        (None, Err(e)) => JobOutcome::Errored {
            message: format!("failed to wait for ffmpeg: {e}"),
            diagnostics: tail.summary(),
        },
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. A zero grace kills immediately.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if !grace.is_zero() && signal_terminate(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(res) => return res,
            Err(_) => warn!("ffmpeg ignored SIGTERM for {grace:?}; killing it"),
        }
    }
    // Fails only if the process is already gone, which is what we want anyway.
    let _ = child.kill().await;
    child.wait().await
}

#[cfg(unix)]
fn signal_terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: plain syscall on the pid of a child we have not reaped yet.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) -> bool {
    false
}
