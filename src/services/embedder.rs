//! Embedding service client.
//!
//! Talks to a ColPali-style HTTP service that turns page images into
//! multi-vector embeddings with explicit image-token boundaries, and
//! implements the row/column mean pooling used for prefetch vectors.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use reqwest::multipart;
use serde::{Deserialize, Serialize};

use crate::pipeline::types::MultiVector;

/// Image dimensions submitted to the patch-grid endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

/// Patch grid for one image, a pure function of its dimensions.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PatchGrid {
    pub n_patches_x: usize,
    pub n_patches_y: usize,
}

/// One page's embedding plus the contiguous token range holding its
/// visual patches.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageEmbedding {
    pub embedding: MultiVector,
    pub image_patch_start: usize,
    pub image_patch_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub dim: usize,
    #[serde(default)]
    pub model_name: Option<String>,
}

/// Client for the embedding service.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of page images; output is aligned 1-to-1 with input.
    async fn embed_images(&self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>>;

    /// Patch grids for the given image dimensions.
    async fn patch_grids(&self, dims: &[ImageDims]) -> Result<Vec<PatchGrid>>;

    /// Model information, probed at startup for the dimension check.
    async fn model_info(&self) -> Result<ModelInfo>;
}

#[derive(Debug, Deserialize)]
struct EmbedImagesResponse {
    embeddings: Vec<ImageEmbedding>,
}

#[derive(Debug, Deserialize)]
struct PatchesResponse {
    patches: Vec<PatchGrid>,
}

#[derive(Debug, Serialize)]
struct PatchesRequest<'a> {
    dimensions: &'a [ImageDims],
}

/// HTTP implementation of [`EmbeddingClient`].
pub struct HttpEmbeddingClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new(endpoint: &str, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Check if the embedding service answers its info endpoint.
    pub async fn is_available(&self) -> bool {
        self.model_info().await.is_ok()
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed_images(&self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        let mut form = multipart::Form::new();
        for (idx, img) in images.iter().enumerate() {
            let mut buffer = std::io::Cursor::new(Vec::new());
            img.write_to(&mut buffer, image::ImageFormat::Png)
                .context("Failed to encode page for embedding request")?;
            let part = multipart::Part::bytes(buffer.into_inner())
                .file_name(format!("page_{}.png", idx))
                .mime_str("image/png")?;
            form = form.part("files", part);
        }

        let url = format!("{}/embed/images", self.endpoint);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Embedding request to {} failed", url))?
            .error_for_status()
            .context("Embedding service returned an error")?;

        let body: EmbedImagesResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if body.embeddings.len() != images.len() {
            bail!(
                "Embedding service returned {} embeddings for {} images",
                body.embeddings.len(),
                images.len()
            );
        }
        Ok(body.embeddings)
    }

    async fn patch_grids(&self, dims: &[ImageDims]) -> Result<Vec<PatchGrid>> {
        let url = format!("{}/patches", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&PatchesRequest { dimensions: dims })
            .send()
            .await
            .with_context(|| format!("Patch request to {} failed", url))?
            .error_for_status()
            .context("Patch endpoint returned an error")?;

        let body: PatchesResponse = response
            .json()
            .await
            .context("Failed to parse patch response")?;

        if body.patches.len() != dims.len() {
            bail!(
                "Patch endpoint returned {} grids for {} dimensions",
                body.patches.len(),
                dims.len()
            );
        }
        Ok(body.patches)
    }

    async fn model_info(&self) -> Result<ModelInfo> {
        let url = format!("{}/info", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Info request to {} failed", url))?
            .error_for_status()
            .context("Info endpoint returned an error")?;
        response.json().await.context("Failed to parse model info")
    }
}

/// Mean-pool a page's image tokens by rows and by columns, preserving
/// prefix and postfix tokens around the patch range.
///
/// The patch slice `[start, start + patch_len)` is interpreted as an
/// `[x_patches, y_patches]` grid in row-major order. Pooling by rows
/// averages across x (yielding `y_patches` vectors); pooling by columns
/// averages across y (yielding `x_patches` vectors).
pub fn pool_image_tokens(
    embedding: &MultiVector,
    start: usize,
    patch_len: usize,
    x_patches: usize,
    y_patches: usize,
) -> Result<(MultiVector, MultiVector)> {
    let total_tokens = embedding.len();
    if patch_len == 0 {
        bail!("Invalid image token boundaries: patch_len=0");
    }
    let end = start + patch_len;
    if end > total_tokens {
        bail!(
            "Image token slice out of bounds: end={}, total_tokens={}",
            end,
            total_tokens
        );
    }
    if patch_len != x_patches * y_patches {
        bail!(
            "image_patch_len ({}) != x_patches*y_patches ({})",
            patch_len,
            x_patches * y_patches
        );
    }

    let dim = embedding[start].len();
    let patches = &embedding[start..end];

    let mut by_rows = vec![vec![0.0f32; dim]; y_patches];
    let mut by_columns = vec![vec![0.0f32; dim]; x_patches];
    for (idx, token) in patches.iter().enumerate() {
        if token.len() != dim {
            bail!("Inconsistent embedding dimension within patch tokens");
        }
        let x = idx / y_patches;
        let y = idx % y_patches;
        for (d, value) in token.iter().enumerate() {
            by_rows[y][d] += value;
            by_columns[x][d] += value;
        }
    }
    for row in &mut by_rows {
        for value in row.iter_mut() {
            *value /= x_patches as f32;
        }
    }
    for col in &mut by_columns {
        for value in col.iter_mut() {
            *value /= y_patches as f32;
        }
    }

    let prefix = &embedding[..start];
    let postfix = &embedding[end..];
    let assemble = |pooled: Vec<Vec<f32>>| -> MultiVector {
        let mut out = Vec::with_capacity(prefix.len() + pooled.len() + postfix.len());
        out.extend_from_slice(prefix);
        out.extend(pooled);
        out.extend_from_slice(postfix);
        out
    };

    Ok((assemble(by_rows), assemble(by_columns)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_image_tokens_means() {
        // 2x2 patch grid with 1-dim tokens, one prefix and one postfix token.
        // Patch values laid out row-major over [x=2][y=2]: 1, 2, 3, 4.
        let embedding: MultiVector = vec![
            vec![100.0], // prefix
            vec![1.0],   // (x=0, y=0)
            vec![2.0],   // (x=0, y=1)
            vec![3.0],   // (x=1, y=0)
            vec![4.0],   // (x=1, y=1)
            vec![200.0], // postfix
        ];
        let (rows, cols) = pool_image_tokens(&embedding, 1, 4, 2, 2).unwrap();

        // Rows: mean across x -> [(1+3)/2, (2+4)/2]
        assert_eq!(rows, vec![
            vec![100.0],
            vec![2.0],
            vec![3.0],
            vec![200.0],
        ]);
        // Columns: mean across y -> [(1+2)/2, (3+4)/2]
        assert_eq!(cols, vec![
            vec![100.0],
            vec![1.5],
            vec![3.5],
            vec![200.0],
        ]);
    }

    #[test]
    fn test_pool_rejects_bad_boundaries() {
        let embedding: MultiVector = vec![vec![1.0]; 4];
        assert!(pool_image_tokens(&embedding, 2, 4, 2, 2).is_err());
        assert!(pool_image_tokens(&embedding, 0, 3, 2, 2).is_err());
        assert!(pool_image_tokens(&embedding, 0, 0, 0, 0).is_err());
    }

    #[test]
    fn test_pool_preserves_token_counts() {
        let embedding: MultiVector = vec![vec![0.5; 8]; 10];
        let (rows, cols) = pool_image_tokens(&embedding, 1, 8, 2, 4).unwrap();
        // 1 prefix + 4 pooled rows + 1 postfix
        assert_eq!(rows.len(), 6);
        // 1 prefix + 2 pooled columns + 1 postfix
        assert_eq!(cols.len(), 4);
    }
}
