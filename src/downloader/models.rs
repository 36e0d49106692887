// Common data models for the download pipeline

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Desktop Chrome user agent sent with every media request
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                                      (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Selector handed to the media service when the planner finds nothing
pub const GENERIC_FORMAT_EXPRESSION: &str = "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b";

/// Lowest-common-denominator selector for YouTube extractor churn
pub const YOUTUBE_CHURN_FORMAT_EXPRESSION: &str = "18/best[ext=mp4]/best";

/// Origin of a URL, selects the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceCategory {
    Generic,
    /// youtube.com, youtu.be
    YouTube,
    /// instagram.com, instagr.am
    Instagram,
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::YouTube => write!(f, "youtube"),
            Self::Instagram => write!(f, "instagram"),
        }
    }
}

/// One encoding offered by the media service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Format ID (e.g., "137", "140"), unique within one metadata snapshot
    pub id: String,
    /// File extension (mp4, webm, m4a)
    pub container: String,
    /// Video codec, `None` when the format carries no video
    pub video_codec: Option<String>,
    /// Audio codec, `None` when the format carries no audio
    pub audio_codec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    /// Total bitrate in kbps
    pub bitrate: Option<f64>,
    /// Audio bitrate in kbps
    pub audio_bitrate: Option<f64>,
    pub exact_size_bytes: Option<u64>,
    pub approx_size_bytes: Option<u64>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        self.video_codec.as_deref().is_some_and(|v| !v.is_empty() && v != "none")
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.as_deref().is_some_and(|a| !a.is_empty() && a != "none")
    }

    pub fn is_progressive(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    /// Check if video is H.264 (avc1)
    pub fn is_h264(&self) -> bool {
        self.video_codec.as_deref().is_some_and(|v| v.starts_with("avc1"))
    }

    /// Check if audio is AAC (mp4a)
    pub fn is_aac(&self) -> bool {
        self.audio_codec.as_deref().is_some_and(|a| a.starts_with("mp4a"))
    }

    /// Declared size, exact first
    pub fn declared_size(&self) -> Option<u64> {
        self.exact_size_bytes
            .filter(|s| *s > 0)
            .or(self.approx_size_bytes.filter(|s| *s > 0))
    }
}

/// Metadata snapshot, fetched once per job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Duration in whole seconds
    pub duration: Option<u64>,
    pub formats: Vec<FormatDescriptor>,
}

impl MediaMetadata {
    pub fn format(&self, id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.id == id)
    }
}

/// Output of the format planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPlan {
    /// "id" or "videoId+audioId"
    pub format_spec: String,
    pub requires_merge: bool,
    pub merge_container: Option<String>,
}

impl DownloadPlan {
    pub fn progressive(id: &str) -> Self {
        Self {
            format_spec: id.to_string(),
            requires_merge: false,
            merge_container: None,
        }
    }

    pub fn separate(video_id: &str, audio_id: &str, container: &str) -> Self {
        Self {
            format_spec: format!("{}+{}", video_id, audio_id),
            requires_merge: true,
            merge_container: Some(container.to_string()),
        }
    }

    /// Format ids referenced by this plan
    pub fn format_ids(&self) -> impl Iterator<Item = &str> {
        self.format_spec.split('+')
    }
}

/// What the media service is asked to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelection {
    /// Concrete ids chosen by the planner
    Planned(DownloadPlan),
    /// A selector expression evaluated by the media service itself
    Expression {
        spec: String,
        merge_container: Option<String>,
    },
}

impl FormatSelection {
    pub fn generic(container: &str) -> Self {
        Self::Expression {
            spec: GENERIC_FORMAT_EXPRESSION.to_string(),
            merge_container: Some(container.to_string()),
        }
    }

    pub fn format_spec(&self) -> &str {
        match self {
            Self::Planned(plan) => &plan.format_spec,
            Self::Expression { spec, .. } => spec,
        }
    }

    pub fn merge_container(&self) -> Option<&str> {
        match self {
            Self::Planned(plan) => plan.merge_container.as_deref(),
            Self::Expression { merge_container, .. } => merge_container.as_deref(),
        }
    }
}

/// Every option understood by the media service, one value per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOptions {
    pub http_headers: BTreeMap<String, String>,
    /// Path to cookies.txt, only set when the file exists
    pub cookie_file: Option<PathBuf>,
    pub socket_timeout_secs: u32,
    pub retries: u32,
    pub fragment_retries: u32,
    /// Browser impersonation target (e.g. "chrome")
    pub impersonate: Option<String>,
    pub js_runtimes: Vec<String>,
    pub remote_components: Vec<String>,
    pub concurrent_fragments: u32,
    pub max_filesize: Option<u64>,
    pub no_playlist: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        let mut http_headers = BTreeMap::new();
        http_headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());

        Self {
            http_headers,
            cookie_file: None,
            socket_timeout_secs: 20,
            retries: 5,
            fragment_retries: 5,
            impersonate: None,
            js_runtimes: Vec::new(),
            remote_components: Vec::new(),
            concurrent_fragments: 1,
            max_filesize: None,
            no_playlist: true,
        }
    }
}

/// One file reported by the media service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub path: PathBuf,
    /// `Some(true)` when the service classified this entry as audio-only
    pub audio_only: Option<bool>,
}

/// Result of a successful download call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Final (post-merge) file, if the service reports one
    pub final_path: Option<PathBuf>,
    pub requested: Vec<ProducedFile>,
}
