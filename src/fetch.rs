use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::StepError;
use crate::tool::{RunOptions, Tool, ToolError, ensure_non_empty};

const APIFY_API: &str = "https://api.apify.com/v2";

/// yt-dlp error fragments that mean the source itself cannot be resolved
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Video unavailable",
    "Private video",
    "This video has been removed",
    "is not a valid URL",
    "Incomplete YouTube ID",
    "HTTP Error 404",
];

/// Materializes one source as a local media file
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source_id: &str, dest: &Path) -> Result<(), StepError>;
}

/// Resolves a source id to a directly downloadable media URL
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source_id: &str) -> Result<String, StepError>;
}

/// Expand `{id}` in a source URL template
pub fn source_url(template: &str, source_id: &str) -> String {
    template.replace("{id}", source_id)
}

/// Fetcher that hands format selection and download to yt-dlp
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    yt_dlp: Tool,
    url_template: String,
    socket_timeout: Duration,
    deadline: Duration,
}

impl YtDlpFetcher {
    /// `socket_timeout` bounds each network stall, `deadline` the whole download
    pub fn new(yt_dlp: Tool, url_template: impl Into<String>, socket_timeout: Duration, deadline: Duration) -> Self {
        Self {
            yt_dlp,
            url_template: url_template.into(),
            socket_timeout,
            deadline,
        }
    }

    fn build_args(&self, url: &str, dest: &Path) -> Vec<String> {
        vec![
            "-f".to_string(),
            "b".to_string(), // best single file, no merging of separate streams
            "--no-check-certificates".to_string(),
            "--no-warnings".to_string(),
            "--prefer-free-formats".to_string(),
            "--no-playlist".to_string(),
            "--force-overwrites".to_string(),
            "--socket-timeout".to_string(),
            self.socket_timeout.as_secs().max(1).to_string(),
            "-o".to_string(),
            dest.to_string_lossy().to_string(),
            url.to_string(),
        ]
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, source_id: &str, dest: &Path) -> Result<(), StepError> {
        let url = source_url(&self.url_template, source_id);
        info!("Downloading {url} via yt-dlp");

        let opts = RunOptions {
            expected_duration: None,
            timeout: Some(self.deadline),
        };
        match self.yt_dlp.run(&self.build_args(&url, dest), &opts).await {
            Ok(()) => {}
            Err(ToolError::Failed { stderr, status, .. }) => {
                return Err(classify_yt_dlp_failure(source_id, &status, &stderr));
            }
            Err(e) => return Err(StepError::DownloadFailed(e.to_string())),
        }

        let size = ensure_non_empty(dest)
            .await
            .map_err(|e| StepError::DownloadFailed(e.to_string()))?;
        debug!("Downloaded {source_id}: {size} bytes");
        Ok(())
    }
}

fn classify_yt_dlp_failure(source_id: &str, status: &str, stderr: &str) -> StepError {
    if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        StepError::SourceUnavailable(format!("{source_id}: {stderr}"))
    } else {
        StepError::DownloadFailed(format!("yt-dlp exited with {status}: {stderr}"))
    }
}

#[derive(Debug, Deserialize)]
struct DatasetItem {
    #[serde(rename = "downloadUrl")]
    download_url: Option<String>,
}

/// Looks sources up through an Apify actor that returns download URLs
#[derive(Debug, Clone)]
pub struct ApifyResolver {
    client: reqwest::Client,
    api_base: String,
    token: String,
    actor: String,
    url_template: String,
}

impl ApifyResolver {
    pub fn new(
        client: reqwest::Client,
        token: impl Into<String>,
        actor: impl Into<String>,
        url_template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: APIFY_API.to_string(),
            token: token.into(),
            actor: actor.into(),
            url_template: url_template.into(),
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl SourceResolver for ApifyResolver {
    async fn resolve(&self, source_id: &str) -> Result<String, StepError> {
        let endpoint = format!("{}/acts/{}/run-sync-get-dataset-items", self.api_base, self.actor);
        let body = serde_json::json!({
            "startUrls": [source_url(&self.url_template, source_id)],
            "proxy": { "useApifyProxy": true }
        });

        debug!("Resolving {source_id} via Apify actor {}", self.actor);

        let resp = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StepError::DownloadFailed(format!("content source lookup failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StepError::DownloadFailed(format!(
                "content source lookup returned {status}: {body}"
            )));
        }

        let items: Vec<DatasetItem> = resp
            .json()
            .await
            .map_err(|e| StepError::DownloadFailed(format!("unexpected content source response: {e}")))?;

        first_download_url(items)
            .ok_or_else(|| StepError::SourceUnavailable(format!("{source_id}: video download URL not found")))
    }
}

fn first_download_url(items: Vec<DatasetItem>) -> Option<String> {
    items
        .into_iter()
        .next()
        .and_then(|item| item.download_url)
        .filter(|url| !url.trim().is_empty())
}

/// Build the HTTP client used for media downloads
pub fn download_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
}

/// Fetcher that resolves a direct media URL and streams it to disk
#[derive(Debug, Clone)]
pub struct HttpFetcher<R> {
    client: reqwest::Client,
    resolver: R,
}

impl<R: SourceResolver> HttpFetcher<R> {
    pub fn new(client: reqwest::Client, resolver: R) -> Self {
        Self { client, resolver }
    }
}

#[async_trait]
impl<R: SourceResolver> Fetcher for HttpFetcher<R> {
    async fn fetch(&self, source_id: &str, dest: &Path) -> Result<(), StepError> {
        let url = self.resolver.resolve(source_id).await?;
        info!("Downloading from: {url}");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StepError::DownloadFailed(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StepError::SourceUnavailable(format!("{source_id}: media URL returned {status}")));
        }
        if !status.is_success() {
            return Err(StepError::DownloadFailed(format!("media URL returned {status}")));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StepError::DownloadFailed(format!("cannot create {}: {e}", dest.display())))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StepError::DownloadFailed(format!("transfer interrupted: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| StepError::DownloadFailed(format!("write to {} failed: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| StepError::DownloadFailed(format!("write to {} failed: {e}", dest.display())))?;

        let size = ensure_non_empty(dest)
            .await
            .map_err(|_| StepError::DownloadFailed("downloaded file is empty".to_string()))?;
        debug!("Downloaded {source_id}: {size} bytes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Result<String, String>);

    #[async_trait]
    impl SourceResolver for FixedResolver {
        async fn resolve(&self, source_id: &str) -> Result<String, StepError> {
            self.0
                .clone()
                .map_err(|msg| StepError::SourceUnavailable(format!("{source_id}: {msg}")))
        }
    }

    #[test]
    fn test_source_url() {
        assert_eq!(
            source_url("https://www.youtube.com/watch?v={id}", "dQw4w9WgXcQ"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn test_yt_dlp_args() {
        let fetcher = YtDlpFetcher::new(
            Tool::yt_dlp("yt-dlp"),
            "https://x/{id}",
            Duration::from_secs(30),
            Duration::from_secs(1800),
        );
        let args = fetcher.build_args("https://x/abc", Path::new("/w/source-0.mp4"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-f b "));
        assert!(joined.contains("--socket-timeout 30"));
        assert!(joined.ends_with("-o /w/source-0.mp4 https://x/abc"));
    }

    #[test]
    fn test_classify_unavailable() {
        let err = classify_yt_dlp_failure("abc", "exit status: 1", "ERROR: [youtube] abc: Video unavailable");
        assert!(matches!(err, StepError::SourceUnavailable(_)));
    }

    #[test]
    fn test_classify_transport_failure() {
        let err = classify_yt_dlp_failure("abc", "exit status: 1", "ERROR: Unable to download webpage: timed out");
        assert!(matches!(err, StepError::DownloadFailed(_)));
    }

    #[test]
    fn test_first_download_url() {
        let json = r#"[{"downloadUrl": "https://cdn/x.mp4", "title": "x"}, {"downloadUrl": "https://cdn/y.mp4"}]"#;
        let items: Vec<DatasetItem> = serde_json::from_str(json).unwrap();
        assert_eq!(first_download_url(items), Some("https://cdn/x.mp4".to_string()));
    }

    #[test]
    fn test_first_download_url_missing() {
        let items: Vec<DatasetItem> = serde_json::from_str(r#"[{"title": "x"}]"#).unwrap();
        assert_eq!(first_download_url(items), None);
        let items: Vec<DatasetItem> = serde_json::from_str("[]").unwrap();
        assert_eq!(first_download_url(items), None);
        let items: Vec<DatasetItem> = serde_json::from_str(r#"[{"downloadUrl": " "}]"#).unwrap();
        assert_eq!(first_download_url(items), None);
    }

    #[tokio::test]
    async fn test_http_fetcher_propagates_unresolved_source() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(reqwest::Client::new(), FixedResolver(Err("not found".to_string())));
        let err = fetcher.fetch("abc", &dir.path().join("source-0.mp4")).await.unwrap_err();
        assert!(matches!(err, StepError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = download_client(Duration::from_secs(2)).unwrap();
        let fetcher = HttpFetcher::new(client, FixedResolver(Ok("http://127.0.0.1:1/video.mp4".to_string())));
        let err = fetcher.fetch("abc", &dir.path().join("source-0.mp4")).await.unwrap_err();
        assert!(matches!(err, StepError::DownloadFailed(_)));
    }

    #[tokio::test]
    async fn test_stalled_lookup_times_out_as_download_failure() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = download_client(Duration::from_millis(200)).unwrap();
        let resolver = ApifyResolver::new(client, "token", "actor", "https://www.youtube.com/watch?v={id}")
            .with_api_base(format!("http://{addr}"));

        let started = std::time::Instant::now();
        let err = resolver.resolve("abc").await.unwrap_err();

        assert!(matches!(err, StepError::DownloadFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        server.abort();
    }
}
