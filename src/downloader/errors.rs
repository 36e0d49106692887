// Error types for the download pipeline

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Metadata could not be obtained (network or parse failure)
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The media service does not recognise the site
    #[error("unsupported URL: {0}")]
    Unsupported(String),

    /// Transient or terminal transfer failure (network, blocked, size limit)
    #[error("download failed: {0}")]
    Download(String),

    /// Produced file exceeds the byte ceiling
    #[error("output {path} is {size} bytes, limit is {limit}")]
    OversizedOutput { path: PathBuf, size: u64, limit: u64 },

    /// Nothing usable was produced for the job prefix
    #[error("downloaded file not found")]
    OutputNotFound,

    /// The messaging service rejected the artifact
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which media service call produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Download,
}

impl DownloadError {
    /// Classify yt-dlp stderr output for the given stage.
    pub fn from_stderr(stage: Stage, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let detail = summarize(stderr);

        if lower.contains("unsupported url") {
            return Self::Unsupported(detail);
        }

        match stage {
            Stage::Metadata => Self::Extraction(detail),
            Stage::Download => Self::Download(detail),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Keep the lines that carry the actual error, yt-dlp prints a lot of noise.
fn summarize(stderr: &str) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ERROR:"))
        .collect();

    let picked = if errors.is_empty() {
        stderr.lines().map(str::trim).filter(|l| !l.is_empty()).take(3).collect::<Vec<_>>()
    } else {
        errors
    };

    let joined = picked.join(" | ");
    if joined.is_empty() {
        "no output".to_string()
    } else {
        joined
    }
}
