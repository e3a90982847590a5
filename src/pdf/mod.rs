//! PDF page decoding via poppler command-line tools.
//!
//! `pdfinfo` reports the page count and `pdftoppm` rasterizes page windows
//! into a temp directory. The subprocess work runs under `spawn_blocking`
//! so stage tasks stay responsive. A trait boundary lets tests substitute
//! a synthetic decoder.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use image::DynamicImage;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image load failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Decodes PDF pages into owned images.
#[async_trait]
pub trait PageDecoder: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, path: &Path) -> Result<u32, DecodeError>;

    /// Decode the inclusive 1-indexed page window `[first_page, last_page]`,
    /// returning fully loaded images in page order.
    async fn decode_range(
        &self,
        path: &Path,
        first_page: u32,
        last_page: u32,
    ) -> Result<Vec<DynamicImage>, DecodeError>;
}

/// Poppler-backed decoder (`pdfinfo` + `pdftoppm`).
#[derive(Debug, Clone)]
pub struct PopplerDecoder {
    /// Rasterization resolution in DPI.
    dpi: u32,
}

impl Default for PopplerDecoder {
    fn default() -> Self {
        Self { dpi: 150 }
    }
}

impl PopplerDecoder {
    pub fn new(dpi: u32) -> Self {
        Self { dpi: dpi.max(36) }
    }

    /// Report availability of the poppler tools this decoder shells out to.
    pub fn check_tools() -> Vec<(&'static str, bool)> {
        ["pdfinfo", "pdftoppm"]
            .iter()
            .map(|tool| (*tool, which::which(tool).is_ok()))
            .collect()
    }

    fn run_pdfinfo(path: &Path) -> Result<u32, DecodeError> {
        let output = Command::new("pdfinfo").arg(path).output();
        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DecodeError::ToolNotFound(
                    "pdfinfo (install poppler-utils)".to_string(),
                ));
            }
            Err(e) => return Err(DecodeError::Io(e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::DecodeFailed(format!(
                "pdfinfo failed: {}",
                stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if line.starts_with("Pages:") {
                if let Some(pages) = line.split_whitespace().nth(1).and_then(|s| s.parse().ok()) {
                    return Ok(pages);
                }
            }
        }
        Err(DecodeError::DecodeFailed(
            "pdfinfo output did not contain a page count".to_string(),
        ))
    }

    fn run_pdftoppm(
        path: &Path,
        first_page: u32,
        last_page: u32,
        dpi: u32,
    ) -> Result<Vec<DynamicImage>, DecodeError> {
        let temp_dir = TempDir::new()?;
        let output_prefix = temp_dir.path().join("page");

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &dpi.to_string()])
            .args(["-f", &first_page.to_string(), "-l", &last_page.to_string()])
            .arg(path)
            .arg(&output_prefix)
            .status();

        match status {
            Ok(s) if s.success() => {}
            Ok(_) => {
                return Err(DecodeError::DecodeFailed(format!(
                    "pdftoppm failed on pages {}-{}",
                    first_page, last_page
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DecodeError::ToolNotFound(
                    "pdftoppm (install poppler-utils)".to_string(),
                ));
            }
            Err(e) => return Err(DecodeError::Io(e)),
        }

        let mut images = Vec::with_capacity((last_page - first_page + 1) as usize);
        for page in first_page..=last_page {
            let image_path = find_page_image(temp_dir.path(), page).ok_or_else(|| {
                DecodeError::DecodeFailed(format!("No image generated for page {}", page))
            })?;
            // image::open reads the whole file; nothing stays lazily mapped
            // to the temp dir after this point.
            images.push(image::open(&image_path)?);
        }
        Ok(images)
    }
}

/// Find the image pdftoppm produced for a page. Filenames are zero-padded
/// to the width of the document's last page number (page-1.png,
/// page-07.png, page-012.png, ...).
fn find_page_image(dir: &Path, page: u32) -> Option<PathBuf> {
    for digits in [1usize, 2, 3, 4, 5] {
        let candidate = dir.join(format!("page-{:0width$}.png", page, width = digits));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[async_trait]
impl PageDecoder for PopplerDecoder {
    async fn page_count(&self, path: &Path) -> Result<u32, DecodeError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::run_pdfinfo(&path))
            .await
            .map_err(|e| DecodeError::DecodeFailed(format!("pdfinfo task join failed: {}", e)))?
    }

    async fn decode_range(
        &self,
        path: &Path,
        first_page: u32,
        last_page: u32,
    ) -> Result<Vec<DynamicImage>, DecodeError> {
        let path = path.to_path_buf();
        let dpi = self.dpi;
        tokio::task::spawn_blocking(move || Self::run_pdftoppm(&path, first_page, last_page, dpi))
            .await
            .map_err(|e| DecodeError::DecodeFailed(format!("pdftoppm task join failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_page_image_padding() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-07.png"), b"x").unwrap();
        let found = find_page_image(dir.path(), 7).unwrap();
        assert!(found.ends_with("page-07.png"));
        assert!(find_page_image(dir.path(), 8).is_none());
    }

    #[test]
    fn test_check_tools_reports_both() {
        let tools = PopplerDecoder::check_tools();
        assert_eq!(tools.len(), 2);
    }
}
