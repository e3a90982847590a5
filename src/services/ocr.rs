//! OCR service client.
//!
//! Talks to a DeepSeek-OCR-style HTTP service. One request per page image;
//! the response carries plain text, markdown, raw model output, labelled
//! bounding boxes, and optionally base64 crops of extracted figures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

use crate::imaging::EncodedImage;

/// Request knobs forwarded to the OCR service on every call.
#[derive(Debug, Clone)]
pub struct OcrRequestOptions {
    /// Processing mode (quality/speed preset).
    pub mode: String,
    /// Task type (markdown, plain_ocr, ...).
    pub task: String,
    pub include_grounding: bool,
    pub include_images: bool,
}

impl Default for OcrRequestOptions {
    fn default() -> Self {
        Self {
            mode: "gundam".to_string(),
            task: "markdown".to_string(),
            include_grounding: true,
            include_images: false,
        }
    }
}

/// One labelled box from the OCR service, in its own coordinate space.
#[derive(Debug, Clone, Deserialize)]
pub struct OcrBoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    #[serde(default)]
    pub label: Option<String>,
}

/// Raw response from the OCR service for one page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub bounding_boxes: Vec<OcrBoundingBox>,
    /// Base64-encoded figure crops, passed through unparsed.
    #[serde(default)]
    pub crops: Vec<String>,
}

/// Client for the OCR service.
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Run OCR on one encoded page image.
    async fn ocr_page(&self, image: &EncodedImage, filename: &str) -> Result<OcrResponse>;
}

/// HTTP implementation of [`OcrClient`].
pub struct HttpOcrClient {
    endpoint: String,
    options: OcrRequestOptions,
    client: reqwest::Client,
}

impl HttpOcrClient {
    pub fn new(endpoint: &str, options: OcrRequestOptions, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            options,
            client,
        }
    }

    /// Check if the OCR service answers its health endpoint.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn ocr_page(&self, image: &EncodedImage, filename: &str) -> Result<OcrResponse> {
        let part = multipart::Part::bytes(image.data.clone())
            .file_name(filename.to_string())
            .mime_str(&image.content_type)?;

        let form = multipart::Form::new()
            .part("image", part)
            .text("mode", self.options.mode.clone())
            .text("task", self.options.task.clone())
            .text("include_grounding", self.options.include_grounding.to_string())
            .text("include_images", self.options.include_images.to_string());

        let url = format!("{}/api/ocr", self.endpoint);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("OCR request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("OCR service rejected {}", filename))?;

        response.json().await.context("Failed to parse OCR response")
    }
}
