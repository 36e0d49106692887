// Media service trait definition

use std::path::Path;

use async_trait::async_trait;

use super::errors::DownloadError;
use super::models::{DownloadOutcome, FormatSelection, MediaMetadata, MediaOptions};

/// Extraction/download backend (yt-dlp in production, stubs in tests)
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Fetch metadata without downloading.
    /// Fails with `Extraction` or `Unsupported`.
    async fn fetch_metadata(
        &self,
        url: &str,
        options: &MediaOptions,
    ) -> Result<MediaMetadata, DownloadError>;

    /// Download `selection` to files named after `output_template`
    /// (e.g. `/tmp/out/<prefix>.%(ext)s`).
    async fn download(
        &self,
        url: &str,
        selection: &FormatSelection,
        options: &MediaOptions,
        output_template: &Path,
    ) -> Result<DownloadOutcome, DownloadError>;
}
