// Orchestrator with per-source fallback chains

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::errors::DownloadError;
use super::models::{
    DownloadOutcome, FormatSelection, MediaMetadata, MediaOptions, SourceCategory,
    YOUTUBE_CHURN_FORMAT_EXPRESSION,
};
use super::output;
use super::traits::MediaService;

/// Values the overlays draw from, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    pub http_headers: BTreeMap<String, String>,
    /// Only set when the file exists
    pub cookie_file: Option<PathBuf>,
    pub js_runtimes: Vec<String>,
    pub remote_components: Vec<String>,
    pub instagram_impersonate: Option<String>,
    pub instagram_retries: u32,
    pub instagram_fragment_retries: u32,
    pub instagram_socket_timeout_secs: u32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            http_headers: MediaOptions::default().http_headers,
            cookie_file: None,
            js_runtimes: vec!["node".to_string()],
            remote_components: vec!["ejs:github".to_string()],
            instagram_impersonate: Some("chrome".to_string()),
            instagram_retries: 8,
            instagram_fragment_retries: 8,
            instagram_socket_timeout_secs: 30,
        }
    }
}

/// Named option overrides for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    Base,
    /// JS runtime and remote component hints
    YouTubeHints,
    /// Single connection, no cookies, lowest-common-denominator format
    YouTubeChurn,
    /// Browser impersonation with extended retries
    InstagramImpersonate,
    /// Plain defaults after impersonation failed
    InstagramPlain,
}

impl Overlay {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::YouTubeHints => "youtube-hints",
            Self::YouTubeChurn => "youtube-churn",
            Self::InstagramImpersonate => "instagram-impersonate",
            Self::InstagramPlain => "instagram-plain",
        }
    }

    /// Selection that replaces the planned one for this attempt
    pub fn format_override(&self) -> Option<FormatSelection> {
        match self {
            Self::YouTubeChurn => Some(FormatSelection::Expression {
                spec: YOUTUBE_CHURN_FORMAT_EXPRESSION.to_string(),
                merge_container: None,
            }),
            _ => None,
        }
    }

    fn apply(&self, options: &mut MediaOptions, settings: &PolicySettings) {
        match self {
            Self::Base | Self::InstagramPlain => {}
            Self::YouTubeHints => {
                options.js_runtimes = settings.js_runtimes.clone();
                options.remote_components = settings.remote_components.clone();
            }
            Self::YouTubeChurn => {
                options.js_runtimes = settings.js_runtimes.clone();
                options.remote_components = settings.remote_components.clone();
                options.concurrent_fragments = 1;
                options.cookie_file = None;
            }
            Self::InstagramImpersonate => {
                options.impersonate = settings.instagram_impersonate.clone();
                options.retries = settings.instagram_retries;
                options.fragment_retries = settings.instagram_fragment_retries;
                options.socket_timeout_secs = settings.instagram_socket_timeout_secs;
            }
        }
    }
}

impl fmt::Display for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const GENERIC_CHAIN: &[Overlay] = &[Overlay::Base];
const YOUTUBE_METADATA_CHAIN: &[Overlay] = &[Overlay::YouTubeHints];
const YOUTUBE_DOWNLOAD_CHAIN: &[Overlay] = &[Overlay::YouTubeHints, Overlay::YouTubeChurn];
const INSTAGRAM_CHAIN: &[Overlay] = &[Overlay::InstagramImpersonate, Overlay::InstagramPlain];

/// Everything one download attempt needs to know about its job
#[derive(Debug, Clone)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub category: SourceCategory,
    pub prefix: &'a str,
    pub folder: &'a Path,
    pub max_bytes: Option<u64>,
    pub concurrent_fragments: u32,
}

impl DownloadRequest<'_> {
    pub fn output_template(&self) -> PathBuf {
        self.folder.join(format!("{}.%(ext)s", self.prefix))
    }
}

/// Result of walking a download chain
#[derive(Debug)]
pub struct AttemptReport {
    pub attempts: usize,
    pub result: Result<DownloadOutcome, DownloadError>,
}

pub struct FallbackPolicy {
    settings: PolicySettings,
}

impl FallbackPolicy {
    pub fn new(settings: PolicySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn metadata_chain(category: SourceCategory) -> &'static [Overlay] {
        match category {
            SourceCategory::Generic => GENERIC_CHAIN,
            SourceCategory::YouTube => YOUTUBE_METADATA_CHAIN,
            SourceCategory::Instagram => INSTAGRAM_CHAIN,
        }
    }

    pub fn download_chain(category: SourceCategory) -> &'static [Overlay] {
        match category {
            SourceCategory::Generic => GENERIC_CHAIN,
            SourceCategory::YouTube => YOUTUBE_DOWNLOAD_CHAIN,
            SourceCategory::Instagram => INSTAGRAM_CHAIN,
        }
    }

    fn base_options(&self) -> MediaOptions {
        MediaOptions {
            http_headers: self.settings.http_headers.clone(),
            cookie_file: self.settings.cookie_file.clone(),
            ..Default::default()
        }
    }

    pub fn metadata_options(&self, overlay: Overlay) -> MediaOptions {
        let mut options = self.base_options();
        overlay.apply(&mut options, &self.settings);
        options
    }

    pub fn download_options(&self, overlay: Overlay, request: &DownloadRequest<'_>) -> MediaOptions {
        let mut options = self.base_options();
        options.concurrent_fragments = request.concurrent_fragments.max(1);
        options.max_filesize = request.max_bytes;
        overlay.apply(&mut options, &self.settings);
        options
    }

    /// Fetch metadata, walking the category's metadata chain.
    pub async fn fetch_metadata(
        &self,
        service: &dyn MediaService,
        url: &str,
        category: SourceCategory,
    ) -> Result<MediaMetadata, DownloadError> {
        let mut last_err = None;

        for (index, overlay) in Self::metadata_chain(category).iter().enumerate() {
            let options = self.metadata_options(*overlay);
            match service.fetch_metadata(url, &options).await {
                Ok(meta) => return Ok(meta),
                Err(e) => {
                    warn!(
                        backend = service.name(),
                        %overlay,
                        attempt = index + 1,
                        error = %e,
                        "metadata fetch failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DownloadError::Extraction("empty metadata chain".to_string())))
    }

    /// Download `selection`, walking the category's download chain until an
    /// attempt succeeds. Partial files of the prefix are discarded between
    /// attempts.
    pub async fn attempt(
        &self,
        service: &dyn MediaService,
        request: &DownloadRequest<'_>,
        selection: &FormatSelection,
    ) -> AttemptReport {
        let chain = Self::download_chain(request.category);
        let template = request.output_template();
        let mut attempts = 0;
        let mut last_err = None;

        for overlay in chain {
            if attempts > 0 {
                output::discard_partials(request.prefix, request.folder);
            }
            attempts += 1;

            let options = self.download_options(*overlay, request);
            let overridden = overlay.format_override();
            let current = overridden.as_ref().unwrap_or(selection);

            info!(
                prefix = request.prefix,
                %overlay,
                attempt = attempts,
                format = current.format_spec(),
                "starting download attempt"
            );

            match service.download(request.url, current, &options, &template).await {
                Ok(outcome) => {
                    return AttemptReport {
                        attempts,
                        result: Ok(outcome),
                    }
                }
                Err(e) => {
                    warn!(
                        prefix = request.prefix,
                        %overlay,
                        attempt = attempts,
                        error = %e,
                        "download attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        AttemptReport {
            attempts,
            result: Err(last_err
                .unwrap_or_else(|| DownloadError::Download("empty download chain".to_string()))),
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(PolicySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::DownloadPlan;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call; fails the first `fail_first` downloads after
    /// leaving a partial file behind.
    struct RecordingService {
        fail_first: usize,
        calls: Mutex<Vec<(String, MediaOptions)>>,
    }

    impl RecordingService {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, MediaOptions)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaService for RecordingService {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn fetch_metadata(
            &self,
            _url: &str,
            options: &MediaOptions,
        ) -> Result<MediaMetadata, DownloadError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(("meta".to_string(), options.clone()));
            if calls.len() <= self.fail_first {
                return Err(DownloadError::Extraction("blocked".to_string()));
            }
            Ok(MediaMetadata::default())
        }

        async fn download(
            &self,
            _url: &str,
            selection: &FormatSelection,
            options: &MediaOptions,
            output_template: &Path,
        ) -> Result<DownloadOutcome, DownloadError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((selection.format_spec().to_string(), options.clone()));
            let partial = output_template
                .to_string_lossy()
                .replace("%(ext)s", &format!("f{}.mp4.part", calls.len()));
            std::fs::write(partial, b"partial").unwrap();
            if calls.len() <= self.fail_first {
                return Err(DownloadError::Download(format!("attempt {} failed", calls.len())));
            }
            Ok(DownloadOutcome::default())
        }
    }

    fn request<'a>(category: SourceCategory, folder: &'a Path) -> DownloadRequest<'a> {
        DownloadRequest {
            url: "https://example.com/v",
            category,
            prefix: "job",
            folder,
            max_bytes: Some(50),
            concurrent_fragments: 4,
        }
    }

    #[test]
    fn test_chain_lengths() {
        assert_eq!(FallbackPolicy::download_chain(SourceCategory::Generic).len(), 1);
        assert_eq!(FallbackPolicy::download_chain(SourceCategory::YouTube).len(), 2);
        assert_eq!(FallbackPolicy::download_chain(SourceCategory::Instagram).len(), 2);
        assert_eq!(FallbackPolicy::metadata_chain(SourceCategory::Generic).len(), 1);
        assert_eq!(FallbackPolicy::metadata_chain(SourceCategory::YouTube).len(), 1);
        assert_eq!(FallbackPolicy::metadata_chain(SourceCategory::Instagram).len(), 2);
    }

    #[test]
    fn test_overlay_options() {
        let policy = FallbackPolicy::new(PolicySettings {
            cookie_file: Some(PathBuf::from("/tmp/cookies.txt")),
            ..Default::default()
        });
        let folder = Path::new("/tmp");
        let req = request(SourceCategory::YouTube, folder);

        let hints = policy.download_options(Overlay::YouTubeHints, &req);
        assert_eq!(hints.js_runtimes, vec!["node".to_string()]);
        assert_eq!(hints.concurrent_fragments, 4);
        assert_eq!(hints.max_filesize, Some(50));
        assert!(hints.cookie_file.is_some());

        let churn = policy.download_options(Overlay::YouTubeChurn, &req);
        assert_eq!(churn.concurrent_fragments, 1);
        assert!(churn.cookie_file.is_none());
        assert!(Overlay::YouTubeChurn.format_override().is_some());

        let ig = policy.download_options(Overlay::InstagramImpersonate, &req);
        assert_eq!(ig.impersonate.as_deref(), Some("chrome"));
        assert_eq!((ig.retries, ig.fragment_retries, ig.socket_timeout_secs), (8, 8, 30));

        let plain = policy.download_options(Overlay::InstagramPlain, &req);
        assert!(plain.impersonate.is_none());
        assert_eq!((plain.retries, plain.fragment_retries, plain.socket_timeout_secs), (5, 5, 20));

        let meta = policy.metadata_options(Overlay::Base);
        assert_eq!(meta.max_filesize, None);
    }

    #[tokio::test]
    async fn test_youtube_falls_back_to_churn_format() {
        let dir = tempfile::tempdir().unwrap();
        let service = RecordingService::new(1);
        let policy = FallbackPolicy::default();
        let selection = FormatSelection::Planned(DownloadPlan::progressive("22"));

        let report = policy
            .attempt(&service, &request(SourceCategory::YouTube, dir.path()), &selection)
            .await;

        assert!(report.result.is_ok());
        assert_eq!(report.attempts, 2);
        let calls = service.calls();
        assert_eq!(calls[0].0, "22");
        assert_eq!(calls[1].0, YOUTUBE_CHURN_FORMAT_EXPRESSION);
        // first attempt's partial is gone, second's is still there
        assert!(!dir.path().join("job.f1.mp4.part").exists());
        assert!(dir.path().join("job.f2.mp4.part").exists());
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = RecordingService::new(usize::MAX);
        let policy = FallbackPolicy::default();
        let selection = FormatSelection::generic("mp4");

        let report = policy
            .attempt(&service, &request(SourceCategory::Instagram, dir.path()), &selection)
            .await;

        assert_eq!(report.attempts, 2);
        match report.result {
            Err(DownloadError::Download(msg)) => assert_eq!(msg, "attempt 2 failed"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generic_stops_after_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let service = RecordingService::new(0);
        let policy = FallbackPolicy::default();

        let report = policy
            .attempt(
                &service,
                &request(SourceCategory::Generic, dir.path()),
                &FormatSelection::generic("mp4"),
            )
            .await;

        assert!(report.result.is_ok());
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_instagram_metadata_retries_without_impersonation() {
        let service = RecordingService::new(1);
        let policy = FallbackPolicy::default();

        policy
            .fetch_metadata(&service, "https://instagram.com/reel/x", SourceCategory::Instagram)
            .await
            .unwrap();

        let calls = service.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.impersonate.as_deref(), Some("chrome"));
        assert!(calls[1].1.impersonate.is_none());
    }

    #[tokio::test]
    async fn test_generic_metadata_single_attempt() {
        let service = RecordingService::new(1);
        let policy = FallbackPolicy::default();

        let err = policy
            .fetch_metadata(&service, "https://example.com/v", SourceCategory::Generic)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Extraction(_)));
        assert_eq!(service.calls().len(), 1);
    }
}
