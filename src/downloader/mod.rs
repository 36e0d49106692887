// Downloader module - planning, fallback chains and output handling

pub mod backends;
pub mod errors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod traits;
pub mod utils;

pub use backends::YtDlpCli;
pub use errors::DownloadError;
pub use format_selector::{FormatPlanner, PlannerSettings};
pub use models::{
    DownloadOutcome, DownloadPlan, FormatDescriptor, FormatSelection, MediaMetadata, MediaOptions,
    ProducedFile, SourceCategory,
};
pub use orchestrator::{AttemptReport, DownloadRequest, FallbackPolicy, Overlay, PolicySettings};
pub use traits::MediaService;
