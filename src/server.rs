use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::director::Director;
use crate::jobs::{JobRegistry, JobState};
use crate::{ClipRange, ClipRequest, JobId, MergedMedia, PipelineError, Seconds};

const GENERATE_FAILED: &str = "Failed to generate video";
const CLIP_FAILED: &str = "Video processing failed";

#[derive(Debug, Clone)]
pub struct AppState {
    pub director: Arc<Director>,
    pub jobs: JobRegistry,
}

impl AppState {
    pub fn new(director: Director) -> Self {
        Self {
            director: Arc::new(director),
            jobs: JobRegistry::new(),
        }
    }
}

/// Error body: `{ success: false, message, error }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            message,
            error: error.into(),
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid request", error)
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found", error)
    }

    fn pipeline(message: &'static str, err: PipelineError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, message, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: &'a str,
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("{}: {}", self.message, self.error);
        }
        let body = ErrorBody {
            success: false,
            message: self.message,
            error: &self.error,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    clips: Vec<ClipRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadClipQuery {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
    #[serde(rename = "startTime")]
    start_time: Option<String>,
    #[serde(rename = "endTime")]
    end_time: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/video/generate", post(generate))
        .route("/video/jobs", post(submit_job))
        .route("/video/status/:job_id", get(job_status))
        .route("/video/download/:job_id", get(download_job))
        .route("/download-clip", get(download_clip))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server running on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn parse_clips(body: &[u8]) -> Result<Vec<ClipRequest>, ApiError> {
    let request: GenerateRequest = serde_json::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))?;
    if request.clips.is_empty() {
        return Err(ApiError::bad_request("no clips requested"));
    }
    Ok(request.clips)
}

/// POST /video/generate: run the pipeline and answer with the merged video
async fn generate(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let clips = parse_clips(&body)?;
    let media = state
        .director
        .run_job(&clips)
        .await
        .map_err(|e| ApiError::pipeline(GENERATE_FAILED, e))?;
    Ok(media_response(media))
}

/// POST /video/jobs: queue the pipeline and answer with a job id to poll
async fn submit_job(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let clips = parse_clips(&body)?;
    let job_id = state
        .jobs
        .submit(Arc::clone(&state.director), clips)
        .map_err(|e| ApiError::pipeline(GENERATE_FAILED, e))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "success": true, "jobId": job_id })),
    )
        .into_response())
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("unknown job {raw}")))
}

async fn job_status(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let status = state
        .jobs
        .status(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown job {id}")))?;
    Ok(Json(status).into_response())
}

async fn download_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    match state.jobs.take_result(&id) {
        None => Err(ApiError::not_found(format!("unknown job {id}"))),
        Some(Err(status)) if status.state == JobState::Failed => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            GENERATE_FAILED,
            status.error.unwrap_or(status.status),
        )),
        Some(Err(status)) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Video is not ready",
            status.status,
        )),
        Some(Ok(media)) => Ok(media_response(media)),
    }
}

/// GET /download-clip: one source, trimmed when both offsets are given
async fn download_clip(
    State(state): State<AppState>,
    Query(query): Query<DownloadClipQuery>,
) -> Result<Response, ApiError> {
    let Some(video_id) = query.video_id.as_deref().filter(|id| !id.trim().is_empty()) else {
        return Err(ApiError::bad_request("Missing videoId parameter"));
    };

    let range = match (query.start_time.as_deref(), query.end_time.as_deref()) {
        (None, None) => None,
        (Some(start), Some(end)) => {
            let start = Seconds::Text(start.to_string()).value();
            let end = Seconds::Text(end.to_string()).value();
            let range = match (start, end) {
                (Ok(start), Ok(end)) => ClipRange::new(start, end).ok(),
                _ => None,
            };
            Some(range.ok_or_else(|| ApiError::bad_request("Invalid time parameters"))?)
        }
        _ => return Err(ApiError::bad_request("Both startTime and endTime are required for trimming")),
    };

    let media = state
        .director
        .fetch_single(video_id, range)
        .await
        .map_err(|e| ApiError::pipeline(CLIP_FAILED, e))?;
    Ok(media_response(media))
}

fn media_response(media: MergedMedia) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", safe_file_name(&media.file_name));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_LENGTH, media.bytes.len().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        media.bytes,
    )
        .into_response()
}

fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::tests::{FakeFetcher, director};
    use std::sync::atomic::Ordering;

    fn state_with(root: &std::path::Path, fetcher: Arc<FakeFetcher>) -> AppState {
        AppState::new(director(root, fetcher, Arc::default(), Arc::default()))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_generate_returns_video_bytes() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());
        let body = Bytes::from(concat!(
            r#"{"clips": [{"videoId": "A", "startTime": 0, "endTime": 5}, "#,
            r#"{"videoId": "B", "startTime": "10", "endTime": "12"}]}"#,
        ));

        let resp = generate(State(state), body).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "22");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"src:A@0-5\nsrc:B@10-12\n");
    }

    #[tokio::test]
    async fn test_generate_rejects_inverted_range_before_download() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let state = state_with(root.path(), fetcher.clone());
        let body = Bytes::from(r#"{"clips": [{"videoId": "A", "startTime": 8, "endTime": 3}]}"#);

        let resp = generate(State(state), body).await.unwrap_err().into_response();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("greater than start offset"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_clip_list() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());
        let resp = generate(State(state), Bytes::from(r#"{"clips": []}"#))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate_pipeline_failure_is_500_with_message() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            fail_at: Some(1),
            ..Default::default()
        });
        let state = state_with(root.path(), fetcher);
        let body = Bytes::from(concat!(
            r#"{"clips": [{"videoId": "A", "startTime": 0, "endTime": 1}, "#,
            r#"{"videoId": "B", "startTime": 0, "endTime": 1}]}"#,
        ));

        let resp = generate(State(state), body).await.unwrap_err().into_response();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], GENERATE_FAILED);
        assert_eq!(json["error"], "clip 2 failed: download failed: timed out");
    }

    #[tokio::test]
    async fn test_generate_unresolvable_source_is_404() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            fail_at: Some(0),
            unavailable: true,
            ..Default::default()
        });
        let state = state_with(root.path(), fetcher);
        let body = Bytes::from(r#"{"clips": [{"videoId": "gone", "startTime": 0, "endTime": 1}]}"#);

        let resp = generate(State(state), body).await.unwrap_err().into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_clip_validation() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());

        let missing = download_clip(State(state.clone()), Query(DownloadClipQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        assert_eq!(missing.error, "Missing videoId parameter");

        let half = DownloadClipQuery {
            video_id: Some("abc".to_string()),
            start_time: Some("1".to_string()),
            end_time: None,
        };
        let err = download_clip(State(state.clone()), Query(half)).await.unwrap_err();
        assert_eq!(err.error, "Both startTime and endTime are required for trimming");

        let inverted = DownloadClipQuery {
            video_id: Some("abc".to_string()),
            start_time: Some("5".to_string()),
            end_time: Some("2".to_string()),
        };
        let err = download_clip(State(state), Query(inverted)).await.unwrap_err();
        assert_eq!(err.error, "Invalid time parameters");
    }

    #[tokio::test]
    async fn test_download_clip_trimmed() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());
        let query = DownloadClipQuery {
            video_id: Some("abc".to_string()),
            start_time: Some("1.5".to_string()),
            end_time: Some("3".to_string()),
        };

        let resp = download_clip(State(state), Query(query)).await.unwrap();

        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"trimmed-abc.mp4\""
        );
    }

    #[tokio::test]
    async fn test_job_routes() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());
        let body = Bytes::from(r#"{"clips": [{"videoId": "A", "startTime": 0, "endTime": 1}]}"#);

        let resp = submit_job(State(state.clone()), body).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();

        let mut completed = false;
        for _ in 0..200 {
            let resp = job_status(State(state.clone()), Path(job_id.clone())).await.unwrap();
            if body_json(resp).await["state"] == "completed" {
                completed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(completed);

        let resp = download_job(State(state.clone()), Path(job_id.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let again = download_job(State(state), Path(job_id)).await.unwrap_err();
        assert_eq!(again.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_job_download_reports_failure_once() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            fail_at: Some(0),
            ..Default::default()
        });
        let state = state_with(root.path(), fetcher);
        let body = Bytes::from(r#"{"clips": [{"videoId": "A", "startTime": 0, "endTime": 1}]}"#);

        let resp = submit_job(State(state.clone()), body).await.unwrap();
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();

        let mut failed = false;
        for _ in 0..200 {
            let resp = job_status(State(state.clone()), Path(job_id.clone())).await.unwrap();
            if body_json(resp).await["state"] == "failed" {
                failed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(failed);

        let err = download_job(State(state.clone()), Path(job_id.clone())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, GENERATE_FAILED);
        assert!(err.error.contains("clip 1 failed"));
        let again = download_job(State(state), Path(job_id)).await.unwrap_err();
        assert_eq!(again.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(root.path(), Arc::default());
        let err = job_status(State(state.clone()), Path("not-a-uuid".to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = job_status(State(state), Path(JobId::new().to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("trimmed-a\"b.mp4"), "trimmed-a_b.mp4");
        assert_eq!(safe_file_name("merged-1234.mp4"), "merged-1234.mp4");
    }
}
