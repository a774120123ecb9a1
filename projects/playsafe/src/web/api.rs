use crate::pipeline::orchestrator::{
    get_processing_state, start_processing, stop_processing, AnalysisRequest,
};
use crate::pipeline::types::Roster;
use crate::run_artifacts::{ANNOTATED_VIDEO_FILE, STATS_FILE};
use crate::run_context::{
    create_run, is_valid_run_id, list_runs, load_run, save_metadata, video_extension,
    RunMetadata,
};
use crate::web::server::AppState;
use async_stream::stream;
use axum::{
    extract::{multipart::Field, Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

type ApiError = (StatusCode, String);

fn not_found(run_id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("unknown run {}", run_id))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn find_run(state: &AppState, run_id: &str) -> Result<RunMetadata, ApiError> {
    if !is_valid_run_id(run_id) {
        return Err(not_found(run_id));
    }
    load_run(&state.output_root, run_id).map_err(|_| not_found(run_id))
}

#[derive(Serialize)]
pub struct RunInfo {
    #[serde(flatten)]
    pub metadata: RunMetadata,
    pub video_url: Option<String>,
    pub stats_url: Option<String>,
    pub progress: serde_json::Value,
}

/// Progress of a run: live if it is registered, otherwise reconstructed from
/// what is on disk (e.g. after a server restart).
fn run_progress(run: &RunMetadata) -> serde_json::Value {
    if let Some(state) = get_processing_state(&run.run_id) {
        return state.to_progress_json();
    }
    let complete = run.annotated_path().exists() && run.output_dir.join(STATS_FILE).exists();
    let error = (!complete).then_some("processing did not finish");
    serde_json::json!({
        "run_id": run.run_id,
        "is_active": false,
        "is_complete": complete,
        "error": error,
    })
}

fn run_info(run: RunMetadata) -> RunInfo {
    let file_url = |name: &str| {
        run.output_dir
            .join(name)
            .exists()
            .then(|| format!("/files/{}/{}", run.run_id, name))
    };
    let video_url = file_url(ANNOTATED_VIDEO_FILE);
    let stats_url = file_url(STATS_FILE);
    let progress = run_progress(&run);
    RunInfo {
        metadata: run,
        video_url,
        stats_url,
        progress,
    }
}

pub async fn get_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunInfo>> {
    let runs = list_runs(&state.output_root).unwrap_or_default();
    Json(runs.into_iter().map(run_info).collect())
}

/// Remove a run whose upload never completed.
async fn discard_run(run: &RunMetadata) {
    tracing::warn!("Discarding incomplete upload {}", run.run_id);
    if let Err(e) = tokio::fs::remove_dir_all(&run.output_dir).await {
        tracing::warn!("Failed to remove {:?}: {}", run.output_dir, e);
    }
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

/// Stream the `video` field into a new run directory.
async fn store_video(output_root: &Path, field: &mut Field<'_>) -> Result<RunMetadata, ApiError> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    if video_extension(&file_name).is_none() {
        return Err(bad_request("video must be an .mp4, .mkv or .avi file"));
    }
    let metadata = create_run(output_root, &file_name, Vec::new()).map_err(internal)?;

    let stored = async {
        let mut file = tokio::fs::File::create(metadata.input_path())
            .await
            .map_err(internal)?;
        let mut bytes = 0usize;
        while let Some(chunk) = field.chunk().await.map_err(bad_request)? {
            bytes += chunk.len();
            file.write_all(&chunk).await.map_err(internal)?;
        }
        file.flush().await.map_err(internal)?;
        Ok::<usize, ApiError>(bytes)
    }
    .await;

    match stored {
        Ok(bytes) => {
            tracing::info!(
                "Stored upload {} ({} bytes) as run {}",
                file_name,
                bytes,
                metadata.run_id
            );
            Ok(metadata)
        }
        Err(e) => {
            discard_run(&metadata).await;
            Err(e)
        }
    }
}

/// Read the whole form. Whatever was stored is removed if any part fails.
async fn receive_upload(
    output_root: &Path,
    multipart: &mut Multipart,
) -> Result<(RunMetadata, String), ApiError> {
    let mut run: Option<RunMetadata> = None;
    let mut roster_text = String::new();

    let received = async {
        while let Some(mut field) = multipart.next_field().await.map_err(bad_request)? {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("video") if run.is_some() => {
                    return Err(bad_request("only one video per upload"));
                }
                Some("video") => run = Some(store_video(output_root, &mut field).await?),
                Some("roster") => roster_text = field.text().await.map_err(bad_request)?,
                _ => {}
            }
        }
        Ok::<(), ApiError>(())
    }
    .await;

    match (received, run) {
        (Ok(()), Some(run)) => Ok((run, roster_text)),
        (Ok(()), None) => Err(bad_request("missing video file")),
        (Err(e), run) => {
            if let Some(run) = run {
                discard_run(&run).await;
            }
            Err(e)
        }
    }
}

/// Accept a multipart upload (`video` file, optional `roster` text), store it
/// in a new run directory and start processing.
pub async fn create_run_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<RunInfo>, ApiError> {
    let (mut run, roster_text) = receive_upload(&state.output_root, &mut multipart).await?;

    let roster = Roster::parse(&roster_text);
    if !roster.is_empty() {
        run.roster = roster.names().to_vec();
        save_metadata(&run).map_err(internal)?;
    }

    let request = AnalysisRequest {
        input: run.input_path(),
        output_video: run.annotated_path(),
        artifacts_dir: Some(run.output_dir.clone()),
        stats_out: None,
        roster,
        detector_model: state.models.detector_model.clone(),
        pose_model: state.models.pose_model.clone(),
        backend: state.models.backend.clone(),
        config: state.config.clone(),
    };
    start_processing(&run.run_id, request).map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;

    Ok(Json(run_info(run)))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(run_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = find_run(&state, &run_id)?;
    Ok(Json(run_progress(&run)))
}

/// Server-sent progress events, every 500 ms until the run finishes.
pub async fn progress_handler(
    UrlPath(run_id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let state = get_processing_state(&run_id).ok_or_else(|| not_found(&run_id))?;

    let events = stream! {
        loop {
            let progress = state.to_progress_json();
            yield Ok(Event::default().event("progress").data(progress.to_string()));
            if state.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(run_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = find_run(&state, &run_id)?;
    let path = run.output_dir.join(STATS_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "stats not available yet".to_string()))?;
    let stats = serde_json::from_str(&content).map_err(internal)?;
    Ok(Json(stats))
}

pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(run_id): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    find_run(&state, &run_id)?;
    if stop_processing(&run_id) {
        tracing::info!("Stop requested for run {}", run_id);
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((StatusCode::CONFLICT, format!("run {} is not processing", run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::FromRequest;

    const VIDEO_PART: &str = "--XBOUNDARY\r\nContent-Disposition: form-data; name=\"video\"; filename=\"match.mp4\"\r\nContent-Type: video/mp4\r\n\r\nvideo bytes";

    async fn form(body: String) -> Multipart {
        let request = axum::http::Request::builder()
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(axum::body::Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_receive_upload() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "{}\r\n--XBOUNDARY\r\nContent-Disposition: form-data; name=\"roster\"\r\n\r\nAhmed\nFahad\r\n--XBOUNDARY--\r\n",
            VIDEO_PART
        );
        let (run, roster) = receive_upload(dir.path(), &mut form(body).await).await.unwrap();
        assert_eq!(roster, "Ahmed\nFahad");
        assert_eq!(std::fs::read(run.input_path()).unwrap(), b"video bytes");
        assert_eq!(list_runs(dir.path()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_upload_leaves_no_run() {
        let dir = tempfile::tempdir().unwrap();
        // Body ends inside the video part, as on a client abort
        let err = receive_upload(dir.path(), &mut form(VIDEO_PART.to_string()).await)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_video_discards_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{}\r\n{}\r\n--XBOUNDARY--\r\n", VIDEO_PART, VIDEO_PART);
        let err = receive_upload(dir.path(), &mut form(body).await).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_progress_of_unregistered_runs() {
        let dir = tempfile::tempdir().unwrap();
        let run = create_run(dir.path(), "match.mp4", Vec::new()).unwrap();

        let progress = run_progress(&run);
        assert_eq!(progress["is_complete"], false);
        assert_eq!(progress["error"], "processing did not finish");

        std::fs::write(run.annotated_path(), b"mp4").unwrap();
        std::fs::write(run.output_dir.join(STATS_FILE), b"{}").unwrap();
        let info = run_info(run.clone());
        assert_eq!(info.progress["is_complete"], true);
        assert_eq!(
            info.video_url,
            Some(format!("/files/{}/annotated.mp4", run.run_id))
        );
    }
}
