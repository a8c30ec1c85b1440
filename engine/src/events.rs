use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::playlist::Playlist;

// --- Event bus --------------------------------------------------------------
//
// Lifecycle and progress notifications fan out over a broadcast channel.
// Delivery is fire-and-forget: if nobody is subscribed the event is dropped,
// and a subscriber that falls behind loses the oldest events (no replay).

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Stopped,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "job.started")]
    JobStarted {
        job_id: Uuid,
        playlist_id: Option<Uuid>,
        display_name: String,
        destination: String,
    },
    /// One ffmpeg `-progress` report, key/value pairs exactly as reported.
    #[serde(rename = "job.progress")]
    JobProgress {
        job_id: Uuid,
        playlist_id: Option<Uuid>,
        progress: BTreeMap<String, String>,
    },
    #[serde(rename = "job.ended")]
    JobEnded {
        job_id: Uuid,
        playlist_id: Option<Uuid>,
        reason: EndReason,
    },
    #[serde(rename = "job.error")]
    JobError {
        job_id: Uuid,
        playlist_id: Option<Uuid>,
        message: String,
        diagnostics: Option<String>,
    },
    #[serde(rename = "playlist.updated")]
    PlaylistUpdated { playlist: Playlist },
    #[serde(rename = "playlist.started")]
    PlaylistStarted {
        playlist_id: Uuid,
        job_id: Uuid,
        index: usize,
    },
    #[serde(rename = "playlist.next")]
    PlaylistNext {
        playlist_id: Uuid,
        job_id: Uuid,
        index: usize,
        file: String,
    },
    #[serde(rename = "playlist.completed")]
    PlaylistCompleted { playlist_id: Uuid },
    #[serde(rename = "playlist.shuffled")]
    PlaylistShuffled { playlist: Playlist },
    #[serde(rename = "playlist.newFilesDiscovered")]
    PlaylistNewFilesDiscovered { playlist_id: Uuid, files: Vec<String> },
    /// A periodic rescan failed. The watch stays registered and is retried next tick.
    #[serde(rename = "watch.error")]
    WatchError {
        playlist_id: Uuid,
        dir: String,
        message: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job.started",
            Self::JobProgress { .. } => "job.progress",
            Self::JobEnded { .. } => "job.ended",
            Self::JobError { .. } => "job.error",
            Self::PlaylistUpdated { .. } => "playlist.updated",
            Self::PlaylistStarted { .. } => "playlist.started",
            Self::PlaylistNext { .. } => "playlist.next",
            Self::PlaylistCompleted { .. } => "playlist.completed",
            Self::PlaylistShuffled { .. } => "playlist.shuffled",
            Self::PlaylistNewFilesDiscovered { .. } => "playlist.newFilesDiscovered",
            Self::WatchError { .. } => "watch.error",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        if !matches!(event, EngineEvent::JobProgress { .. }) {
            tracing::debug!("event: {}", event.name());
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_dotted_event_names() {
        let ev = EngineEvent::PlaylistNewFilesDiscovered {
            playlist_id: Uuid::nil(),
            files: vec!["/m/a.mp4".into()],
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "playlist.newFilesDiscovered");
        assert_eq!(v["files"][0], "/m/a.mp4");
        assert_eq!(ev.name(), "playlist.newFilesDiscovered");

        let ev = EngineEvent::JobEnded {
            job_id: Uuid::nil(),
            playlist_id: None,
            reason: EndReason::Stopped,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "job.ended");
        assert_eq!(v["reason"], "stopped");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::PlaylistCompleted { playlist_id: Uuid::nil() });

        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::PlaylistCompleted { playlist_id: Uuid::nil() });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.name(), "playlist.completed");
    }
}
