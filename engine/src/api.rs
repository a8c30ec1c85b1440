use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::EngineResult,
    options::EncodeOptions,
    playlist::PlaylistPatch,
    shuffle::ShuffleMode,
};

// --- HTTP surface ---------------------------------------------------------------------
//
// Thin JSON adapter over `Engine`. Every success body carries `"ok": true`;
// failures go through `EngineError`'s IntoResponse.

type ApiResult = EngineResult<Json<Value>>;

pub fn build_router(engine: Engine) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/streams", get(api_streams_list).post(api_stream_start))
        .route("/api/v1/streams/:id/stop", post(api_stream_stop))
        .route("/api/v1/playlists", get(api_playlists_list).post(api_playlist_create))
        .route("/api/v1/playlists/import", post(api_playlist_import))
        .route(
            "/api/v1/playlists/:id",
            get(api_playlist_get).patch(api_playlist_update).delete(api_playlist_delete),
        )
        .route("/api/v1/playlists/:id/files", post(api_playlist_add_file))
        .route("/api/v1/playlists/:id/files/remove", post(api_playlist_remove_file))
        .route("/api/v1/playlists/:id/move", post(api_playlist_move))
        .route("/api/v1/playlists/:id/shuffle", post(api_playlist_shuffle))
        .route("/api/v1/playlists/:id/start", post(api_playlist_start))
        .route("/api/v1/playlists/:id/stop", post(api_playlist_stop))
        .route(
            "/api/v1/playlists/:id/watch",
            post(api_watch_enable).delete(api_watch_disable),
        )
        .route("/api/v1/watches", get(api_watches_list))
        .route("/api/v1/events", get(api_events))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn root() -> &'static str {
    "playcast engine is running. Try /api/v1/streams"
}

// --- Streams ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamStartReq {
    file_path: String,
    destination_uri: String,
    #[serde(default)]
    options: EncodeOptions,
}

async fn api_stream_start(State(engine): State<Engine>, Json(req): Json<StreamStartReq>) -> ApiResult {
    let job_id = engine.start_stream(&req.file_path, &req.destination_uri, req.options).await?;
    Ok(Json(json!({"ok": true, "job_id": job_id})))
}

async fn api_stream_stop(State(engine): State<Engine>, Path(id): Path<Uuid>) -> ApiResult {
    engine.stop_stream(id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn api_streams_list(State(engine): State<Engine>) -> Json<Value> {
    Json(json!({"ok": true, "jobs": engine.list_active_jobs().await}))
}

// --- Playlists --------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlaylistCreateReq {
    name: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
struct PlaylistImportReq {
    dir: String,
    #[serde(default)]
    recursive: bool,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AddFileReq {
    path: String,
}

#[derive(Deserialize)]
struct RemoveFileReq {
    index: usize,
}

#[derive(Deserialize)]
struct MoveReq {
    from: usize,
    to: usize,
}

#[derive(Deserialize)]
struct ShuffleReq {
    mode: ShuffleMode,
    window: Option<usize>,
}

#[derive(Deserialize)]
struct PlaylistStartReq {
    destination_uri: String,
    #[serde(default)]
    options: EncodeOptions,
    #[serde(default)]
    seamless: bool,
}

#[derive(Deserialize)]
struct WatchReq {
    dir: String,
    #[serde(default)]
    recursive: bool,
}

async fn api_playlists_list(State(engine): State<Engine>) -> Json<Value> {
    Json(json!({"ok": true, "playlists": engine.list_playlists().await}))
}

async fn api_playlist_create(State(engine): State<Engine>, Json(req): Json<PlaylistCreateReq>) -> ApiResult {
    let playlist = engine.create_playlist(&req.name, req.files).await?;
    Ok(Json(json!({"ok": true, "playlist_id": playlist.id, "playlist": playlist})))
}

async fn api_playlist_import(State(engine): State<Engine>, Json(req): Json<PlaylistImportReq>) -> ApiResult {
    let playlist = engine.import_folder(&req.dir, req.recursive, req.name.as_deref()).await?;
    Ok(Json(json!({"ok": true, "playlist_id": playlist.id, "playlist": playlist})))
}

async fn api_playlist_get(State(engine): State<Engine>, Path(id): Path<Uuid>) -> ApiResult {
    let playlist = engine.get_playlist(id).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_update(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(patch): Json<PlaylistPatch>,
) -> ApiResult {
    let playlist = engine.update_playlist(id, patch).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_delete(State(engine): State<Engine>, Path(id): Path<Uuid>) -> ApiResult {
    engine.delete_playlist(id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn api_playlist_add_file(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddFileReq>,
) -> ApiResult {
    let playlist = engine.add_file(id, &req.path).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_remove_file(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<RemoveFileReq>,
) -> ApiResult {
    let playlist = engine.remove_file_at(id, req.index).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_move(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<MoveReq>,
) -> ApiResult {
    let playlist = engine.reorder(id, req.from, req.to).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_shuffle(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<ShuffleReq>,
) -> ApiResult {
    let playlist = engine.shuffle(id, req.mode, req.window).await?;
    Ok(Json(json!({"ok": true, "playlist": playlist})))
}

async fn api_playlist_start(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<PlaylistStartReq>,
) -> ApiResult {
    let started = engine
        .start_playlist(id, &req.destination_uri, req.options, req.seamless)
        .await?;
    Ok(Json(json!({"ok": true, "playlist_id": started.playlist_id, "job_id": started.job_id})))
}

async fn api_playlist_stop(State(engine): State<Engine>, Path(id): Path<Uuid>) -> ApiResult {
    engine.stop_playlist(id).await?;
    Ok(Json(json!({"ok": true})))
}

// --- Folder watches -----------------------------------------------------------------------

async fn api_watch_enable(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<WatchReq>,
) -> ApiResult {
    let watch = engine.enable_folder_watch(id, &req.dir, req.recursive).await?;
    Ok(Json(json!({"ok": true, "watch": watch})))
}

async fn api_watch_disable(State(engine): State<Engine>, Path(id): Path<Uuid>) -> ApiResult {
    engine.disable_folder_watch(id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn api_watches_list(State(engine): State<Engine>) -> Json<Value> {
    Json(json!({"ok": true, "watches": engine.list_folder_watches().await}))
}

// --- Event stream ------------------------------------------------------------------------

async fn api_events(ws: WebSocketUpgrade, State(engine): State<Engine>) -> Response {
    ws.on_upgrade(move |socket| relay_events(socket, engine))
}

/// Forwards every engine event as a JSON text frame until either side goes away.
async fn relay_events(mut socket: WebSocket, engine: Engine) {
    let mut rx = engine.subscribe();
    info!("event subscriber connected");

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Ok(ev) => {
                    let text = match serde_json::to_string(&ev) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("event {} not serializable: {e}", ev.name());
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("event subscriber lagged; dropped {n} events"),
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Inbound frames carry nothing we act on.
                Some(Ok(_)) => {}
            },
        }
    }

    info!("event subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};

    use super::*;
    use crate::{config::EngineConfig, error::EngineError};

    fn status_of(res: ApiResult) -> StatusCode {
        match res {
            Ok(_) => StatusCode::OK,
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn playlist_handlers_round_trip_through_engine() {
        let engine = Engine::new(EngineConfig::default());

        let Json(created) = api_playlist_create(
            State(engine.clone()),
            Json(PlaylistCreateReq {
                name: "morning".into(),
                files: vec!["/m/a.mp4".into(), "/m/b.mp4".into()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(created["ok"], true);
        let id: Uuid = serde_json::from_value(created["playlist_id"].clone()).unwrap();

        let Json(moved) = api_playlist_move(State(engine.clone()), Path(id), Json(MoveReq { from: 0, to: 1 }))
            .await
            .unwrap();
        assert_eq!(moved["playlist"]["files"], json!(["/m/b.mp4", "/m/a.mp4"]));

        let Json(listed) = api_playlists_list(State(engine.clone())).await;
        assert_eq!(listed["playlists"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn failures_map_to_status_codes() {
        let engine = Engine::new(EngineConfig::default());
        let missing = Uuid::new_v4();

        assert_eq!(
            status_of(api_playlist_get(State(engine.clone()), Path(missing)).await),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(api_stream_stop(State(engine.clone()), Path(missing)).await),
            StatusCode::NOT_FOUND
        );

        let empty = engine.create_playlist("empty", vec![]).await.unwrap();
        let req = PlaylistStartReq {
            destination_uri: "rtmp://ingest/live/key".into(),
            options: EncodeOptions::default(),
            seamless: false,
        };
        assert_eq!(
            status_of(api_playlist_start(State(engine.clone()), Path(empty.id), Json(req)).await),
            StatusCode::BAD_REQUEST
        );

        let err = api_playlist_create(
            State(engine),
            Json(PlaylistCreateReq {
                name: " ".into(),
                files: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn request_bodies_use_defaults() {
        let req: PlaylistStartReq = serde_json::from_str(r#"{"destination_uri":"srt://host:9000"}"#).unwrap();
        assert!(!req.seamless);
        assert_eq!(req.options.video_bitrate_kbps, 2500);

        let req: ShuffleReq = serde_json::from_str(r#"{"mode":"smart","window":3}"#).unwrap();
        assert_eq!(req.mode, ShuffleMode::Smart);
        assert_eq!(req.window, Some(3));
    }
}
