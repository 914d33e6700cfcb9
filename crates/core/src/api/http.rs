//! HTTP implementation of [`MediaService`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::upload::{MediaKind, PendingUpload};

use super::beacon::{spawn_beacon_dispatcher, BeaconHandle};
use super::{
    ApiEnvelope, ApiError, Beacon, HealthStatus, ImageDetection, MediaService, StreamStarted,
    VideoStatus, VideoTaskAccepted,
};

/// Media-analysis service client over HTTP.
pub struct HttpMediaService {
    client: Client,
    base_url: String,
    beacons: Option<BeaconHandle>,
}

impl HttpMediaService {
    /// Create a new client.
    ///
    /// Beacons are available only when created inside a Tokio runtime.
    pub fn new(config: &ServiceConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs as u64))
            .build()
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let base_url = base.as_str().trim_end_matches('/').to_string();
        let beacons = spawn_beacon_dispatcher(client.clone(), base_url.clone());
        if beacons.is_none() {
            debug!("No runtime at construction, beacons disabled");
        }

        Ok(Self {
            client,
            base_url,
            beacons,
        })
    }

    /// Get the base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Resolve an artifact reference against the base URL.
    pub fn resolve(&self, reference: &str) -> Result<Url, ApiError> {
        resolve_reference(&self.base_url, reference)
    }

    fn upload_part(upload: &PendingUpload) -> Result<multipart::Part, ApiError> {
        multipart::Part::bytes(upload.bytes().to_vec())
            .file_name(upload.file_name().to_string())
            .mime_str(upload.content_type())
            .map_err(|e| ApiError::Request(e.to_string()))
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<Response, ApiError> {
        request.send().await.map_err(ApiError::from_reqwest)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = Self::send(self.client.get(self.url(path))).await?;
        parse_envelope::<T>(response).await?.into_data()
    }

    async fn post_ack(&self, path: &str) -> Result<(), ApiError> {
        let response = Self::send(self.client.post(self.url(path))).await?;
        parse_envelope::<serde_json::Value>(response)
            .await?
            .into_ack()
    }
}

/// Read a response body as an envelope.
///
/// Error responses (4xx/5xx) still carry an envelope with the service's
/// message; only a body that is not an envelope falls back to the HTTP status.
async fn parse_envelope<T: DeserializeOwned>(
    response: Response,
) -> Result<ApiEnvelope<T>, ApiError> {
    let status = response.status();
    let body = response.text().await.map_err(ApiError::from_reqwest)?;

    match serde_json::from_str::<ApiEnvelope<T>>(&body) {
        Ok(envelope) => Ok(envelope),
        Err(_) if !status.is_success() => Err(ApiError::Http(status.as_u16())),
        Err(e) => Err(ApiError::Decode(format!(
            "{} (body: {})",
            e,
            body.chars().take(100).collect::<String>()
        ))),
    }
}

/// Resolve an artifact reference (absolute URL or service path) against a base URL.
pub fn resolve_reference(base_url: &str, reference: &str) -> Result<Url, ApiError> {
    let base = Url::parse(base_url)
        .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    base.join(reference)
        .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", reference, e)))
}

#[async_trait]
impl MediaService for HttpMediaService {
    async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.get_json("/api/v1/health").await
    }

    async fn cleanup(&self) -> Result<(), ApiError> {
        self.post_ack("/api/v1/cleanup").await
    }

    async fn detect_image(
        &self,
        upload: &PendingUpload,
        confidence: f32,
    ) -> Result<ImageDetection, ApiError> {
        let form = multipart::Form::new()
            .part(MediaKind::Image.form_field(), Self::upload_part(upload)?)
            .text("conf_threshold", confidence.to_string());

        debug!(
            "Submitting image {} ({} bytes)",
            upload.file_name(),
            upload.len()
        );
        let response = Self::send(
            self.client
                .post(self.url("/api/v1/detect/image"))
                .multipart(form),
        )
        .await?;
        parse_envelope(response).await?.into_data()
    }

    async fn submit_video(
        &self,
        upload: &PendingUpload,
        confidence: f32,
        save_output: bool,
    ) -> Result<VideoTaskAccepted, ApiError> {
        let form = multipart::Form::new()
            .part(MediaKind::Video.form_field(), Self::upload_part(upload)?)
            .text("conf_threshold", confidence.to_string())
            .text("save_output", save_output.to_string());

        debug!(
            "Submitting video {} ({} bytes)",
            upload.file_name(),
            upload.len()
        );
        let response = Self::send(
            self.client
                .post(self.url("/api/v1/detect/video"))
                .multipart(form),
        )
        .await?;
        parse_envelope(response).await?.into_data()
    }

    async fn video_status(&self, task_id: &str) -> Result<VideoStatus, ApiError> {
        self.get_json(&format!(
            "/api/v1/detect/video/status/{}",
            urlencoding::encode(task_id)
        ))
        .await
    }

    async fn start_stream(&self, confidence: f32) -> Result<StreamStarted, ApiError> {
        let params = [("conf_threshold", confidence.to_string())];
        let response = Self::send(
            self.client
                .post(self.url("/api/v1/stream/start"))
                .form(&params),
        )
        .await?;
        parse_envelope(response).await?.into_data()
    }

    async fn stop_stream(&self, stream_id: &str) -> Result<(), ApiError> {
        self.post_ack(&format!(
            "/api/v1/stream/stop/{}",
            urlencoding::encode(stream_id)
        ))
        .await
    }

    async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.resolve(reference)?;
        let response = Self::send(self.client.get(url)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Http(status.as_u16()));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(ApiError::from_reqwest)
    }

    fn send_beacon(&self, beacon: Beacon) -> bool {
        match &self.beacons {
            Some(handle) => handle.queue(beacon),
            None => false,
        }
    }
}
