// Format planner - picks concrete encodings from a metadata snapshot
//
// Priority:
// 1. Progressive (video+audio in one stream) in the target container
// 2. Separate video-only + audio-only pair, merged into the target container
// 3. Nothing - the caller falls back to a selector expression
//
// Codec preference: H.264 video and AAC audio rank above everything else
// because they play everywhere without transcoding.
//
// With a byte budget and `size_aware` set, formats with a known size are
// tried first; formats of unknown size only take part in the size-agnostic
// stages that follow.

use std::cmp::Ordering;

use tracing::debug;

use super::models::{DownloadPlan, FormatDescriptor, FormatSelection, MediaMetadata};

/// How many video candidates the budgeted pair search looks at
pub const MAX_VIDEO_CANDIDATES: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerSettings {
    /// Container the delivered file must have
    pub target_container: String,
    /// Containers accepted for the audio half of a separate pair
    pub audio_containers: Vec<String>,
    /// Apply the byte budget to planning (not only to the download)
    pub size_aware: bool,
    /// Let bitrate-based estimates reject or accept candidates
    pub trust_estimates: bool,
    pub max_video_candidates: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            target_container: "mp4".to_string(),
            audio_containers: vec!["m4a".to_string(), "mp4".to_string()],
            size_aware: true,
            trust_estimates: false,
            max_video_candidates: MAX_VIDEO_CANDIDATES,
        }
    }
}

/// Size of a format as far as we can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeInfo {
    /// `filesize` or `filesize_approx` reported by the service
    Declared(u64),
    /// duration × bitrate, low confidence
    Estimated(u64),
    Unknown,
}

/// Size of one format; estimated from the average bitrate when nothing is declared.
pub fn format_size(format: &FormatDescriptor, duration: Option<u64>) -> SizeInfo {
    if let Some(size) = format.declared_size() {
        return SizeInfo::Declared(size);
    }

    match (duration, format.bitrate) {
        (Some(secs), Some(kbps)) if secs > 0 && kbps > 0.0 => {
            let estimate = (secs as f64 * kbps * 1000.0 / 8.0) as u64;
            if estimate > 0 {
                SizeInfo::Estimated(estimate)
            } else {
                SizeInfo::Unknown
            }
        }
        _ => SizeInfo::Unknown,
    }
}

fn video_rank(format: &FormatDescriptor) -> f64 {
    if format.is_h264() {
        2.0
    } else {
        1.0
    }
}

fn audio_rank(format: &FormatDescriptor) -> f64 {
    if format.is_aac() {
        2.0
    } else {
        1.0
    }
}

fn progressive_key(f: &FormatDescriptor) -> [f64; 5] {
    [
        video_rank(f),
        audio_rank(f),
        f.height.unwrap_or(0) as f64,
        f.fps.unwrap_or(0.0),
        f.bitrate.unwrap_or(0.0),
    ]
}

fn video_key(f: &FormatDescriptor) -> [f64; 4] {
    [
        video_rank(f),
        f.height.unwrap_or(0) as f64,
        f.fps.unwrap_or(0.0),
        f.bitrate.unwrap_or(0.0),
    ]
}

fn audio_key(f: &FormatDescriptor) -> [f64; 2] {
    [audio_rank(f), f.audio_bitrate.or(f.bitrate).unwrap_or(0.0)]
}

/// Lexicographic tuple comparison.
fn compare_keys(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Maximum by key; on ties the earliest format wins.
fn pick_max<'a, I, K>(candidates: I, key: impl Fn(&FormatDescriptor) -> K) -> Option<&'a FormatDescriptor>
where
    I: Iterator<Item = &'a FormatDescriptor>,
    K: AsRef<[f64]>,
{
    let mut best: Option<(&FormatDescriptor, K)> = None;
    for f in candidates {
        let k = key(f);
        let better = match &best {
            None => true,
            Some((_, best_key)) => compare_keys(k.as_ref(), best_key.as_ref()).is_gt(),
        };
        if better {
            best = Some((f, k));
        }
    }
    best.map(|(f, _)| f)
}

/// Deterministic metadata → plan function
#[derive(Debug, Clone, Default)]
pub struct FormatPlanner {
    settings: PlannerSettings,
}

impl FormatPlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Build a plan, or `None` when no combination qualifies.
    pub fn plan(&self, meta: &MediaMetadata, max_bytes: Option<u64>) -> Option<DownloadPlan> {
        let budget = max_bytes.filter(|_| self.settings.size_aware);

        let Some(budget) = budget else {
            return self
                .best_progressive(meta, |_| true)
                .or_else(|| self.best_separate(meta, |_| true));
        };

        let duration = meta.duration;
        let known = |f: &FormatDescriptor| self.usable_size(f, duration);

        self.best_progressive(meta, |f| known(f).is_some_and(|s| s <= budget))
            .or_else(|| self.best_separate_within(meta, budget))
            .or_else(|| self.best_progressive(meta, |f| known(f).is_none()))
            .or_else(|| self.best_separate_unsized(meta, budget))
    }

    /// Plan, falling back to the generic selector expression.
    pub fn select(&self, meta: &MediaMetadata, max_bytes: Option<u64>) -> FormatSelection {
        match self.plan(meta, max_bytes) {
            Some(plan) => {
                debug!(format = %plan.format_spec, merge = plan.requires_merge, "planned formats");
                FormatSelection::Planned(plan)
            }
            None => {
                debug!(
                    formats = meta.formats.len(),
                    "no viable format combination, using generic selector"
                );
                FormatSelection::generic(&self.settings.target_container)
            }
        }
    }

    /// Size that may drive accept/reject decisions.
    fn usable_size(&self, f: &FormatDescriptor, duration: Option<u64>) -> Option<u64> {
        match format_size(f, duration) {
            SizeInfo::Declared(s) => Some(s),
            SizeInfo::Estimated(s) if self.settings.trust_estimates => Some(s),
            _ => None,
        }
    }

    fn progressive_candidates<'a>(
        &'a self,
        meta: &'a MediaMetadata,
    ) -> impl Iterator<Item = &'a FormatDescriptor> + 'a {
        meta.formats.iter().filter(move |f| {
            !f.id.is_empty() && f.container == self.settings.target_container && f.is_progressive()
        })
    }

    fn video_candidates<'a>(
        &'a self,
        meta: &'a MediaMetadata,
    ) -> impl Iterator<Item = &'a FormatDescriptor> + 'a {
        meta.formats.iter().filter(move |f| {
            !f.id.is_empty() && f.container == self.settings.target_container && f.is_video_only()
        })
    }

    fn audio_candidates<'a>(
        &'a self,
        meta: &'a MediaMetadata,
    ) -> impl Iterator<Item = &'a FormatDescriptor> + 'a {
        meta.formats.iter().filter(move |f| {
            !f.id.is_empty()
                && f.is_audio_only()
                && self.settings.audio_containers.iter().any(|c| *c == f.container)
        })
    }

    fn best_progressive(
        &self,
        meta: &MediaMetadata,
        accept: impl Fn(&FormatDescriptor) -> bool,
    ) -> Option<DownloadPlan> {
        pick_max(self.progressive_candidates(meta).filter(|f| accept(*f)), progressive_key)
            .map(|f| DownloadPlan::progressive(&f.id))
    }

    fn best_pair<'a>(
        &'a self,
        meta: &'a MediaMetadata,
        accept: impl Fn(&FormatDescriptor) -> bool,
    ) -> Option<(&'a FormatDescriptor, &'a FormatDescriptor)> {
        let video = pick_max(self.video_candidates(meta).filter(|f| accept(*f)), video_key)?;
        let audio = pick_max(self.audio_candidates(meta).filter(|f| accept(*f)), audio_key)?;
        Some((video, audio))
    }

    fn best_separate(
        &self,
        meta: &MediaMetadata,
        accept: impl Fn(&FormatDescriptor) -> bool,
    ) -> Option<DownloadPlan> {
        self.best_pair(meta, accept)
            .map(|(video, audio)| DownloadPlan::separate(&video.id, &audio.id, &self.settings.target_container))
    }

    /// Pair from formats not known to exceed the budget. When both halves
    /// have usable sizes their sum must fit as well.
    fn best_separate_unsized(&self, meta: &MediaMetadata, budget: u64) -> Option<DownloadPlan> {
        let duration = meta.duration;
        let known = |f: &FormatDescriptor| self.usable_size(f, duration);

        let (video, audio) = self.best_pair(meta, |f| known(f).map_or(true, |s| s <= budget))?;
        if let (Some(v), Some(a)) = (known(video), known(audio)) {
            if v.saturating_add(a) > budget {
                return None;
            }
        }
        Some(DownloadPlan::separate(&video.id, &audio.id, &self.settings.target_container))
    }

    /// Greedy pair search under a byte budget. Not globally optimal: the
    /// best-ranked video that has any fitting audio wins.
    fn best_separate_within(&self, meta: &MediaMetadata, budget: u64) -> Option<DownloadPlan> {
        let duration = meta.duration;

        let mut videos: Vec<(&FormatDescriptor, u64)> = self
            .video_candidates(meta)
            .filter_map(|f| self.usable_size(f, duration).map(|s| (f, s)))
            .filter(|(_, s)| *s <= budget)
            .collect();
        videos.sort_by(|(a, _), (b, _)| compare_keys(&video_key(b), &video_key(a)));
        videos.truncate(self.settings.max_video_candidates);

        let mut audios: Vec<(&FormatDescriptor, u64)> = self
            .audio_candidates(meta)
            .filter_map(|f| self.usable_size(f, duration).map(|s| (f, s)))
            .collect();
        audios.sort_by(|(a, _), (b, _)| compare_keys(&audio_key(b), &audio_key(a)));

        for (video, video_size) in videos {
            let remaining = budget - video_size;
            if let Some((audio, _)) = audios.iter().find(|(_, s)| *s <= remaining) {
                return Some(DownloadPlan::separate(
                    &video.id,
                    &audio.id,
                    &self.settings.target_container,
                ));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::GENERIC_FORMAT_EXPRESSION;

    fn progressive(id: &str, vcodec: &str, height: u32, size: Option<u64>) -> FormatDescriptor {
        FormatDescriptor {
            id: id.to_string(),
            container: "mp4".to_string(),
            video_codec: Some(vcodec.to_string()),
            audio_codec: Some("mp4a.40.2".to_string()),
            height: Some(height),
            fps: Some(30.0),
            bitrate: Some(1000.0),
            exact_size_bytes: size,
            ..Default::default()
        }
    }

    fn video_only(id: &str, vcodec: &str, height: u32, size: Option<u64>) -> FormatDescriptor {
        FormatDescriptor {
            id: id.to_string(),
            container: "mp4".to_string(),
            video_codec: Some(vcodec.to_string()),
            audio_codec: Some("none".to_string()),
            height: Some(height),
            fps: Some(30.0),
            bitrate: Some(2000.0),
            exact_size_bytes: size,
            ..Default::default()
        }
    }

    fn audio_only(id: &str, abr: f64, size: Option<u64>) -> FormatDescriptor {
        FormatDescriptor {
            id: id.to_string(),
            container: "m4a".to_string(),
            video_codec: Some("none".to_string()),
            audio_codec: Some("mp4a.40.2".to_string()),
            audio_bitrate: Some(abr),
            exact_size_bytes: size,
            ..Default::default()
        }
    }

    fn meta(formats: Vec<FormatDescriptor>) -> MediaMetadata {
        MediaMetadata {
            duration: Some(120),
            formats,
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let m = meta(vec![
            progressive("18", "avc1.42001E", 360, Some(5_000_000)),
            progressive("22", "avc1.64001F", 720, Some(9_000_000)),
            video_only("137", "avc1.640028", 1080, Some(6_000_000)),
            audio_only("140", 128.0, Some(2_000_000)),
        ]);
        let planner = FormatPlanner::default();

        let first = planner.plan(&m, Some(10_000_000));
        let second = planner.plan(&m, Some(10_000_000));
        assert_eq!(first, second);
        assert_eq!(first, Some(DownloadPlan::progressive("22")));
    }

    #[test]
    fn test_progressive_beats_separate() {
        let m = meta(vec![
            video_only("137", "avc1.640028", 1080, Some(1_000)),
            audio_only("140", 128.0, Some(1_000)),
            progressive("18", "avc1.42001E", 360, Some(1_000)),
        ]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        assert_eq!(plan.format_spec, "18");
        assert!(!plan.requires_merge);
        assert_eq!(plan.merge_container, None);
    }

    #[test]
    fn test_size_budget_rejects_oversized_progressive() {
        let m = meta(vec![
            progressive("22", "avc1.64001F", 720, Some(12_000_000)),
            video_only("136", "avc1.4d401f", 720, Some(6_000_000)),
            audio_only("140", 128.0, Some(2_000_000)),
        ]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        assert_eq!(plan.format_spec, "136+140");
        assert!(plan.requires_merge);
        assert_eq!(plan.merge_container.as_deref(), Some("mp4"));
    }

    #[test]
    fn test_size_budget_with_nothing_else_yields_no_plan() {
        let m = meta(vec![progressive("22", "avc1.64001F", 720, Some(12_000_000))]);
        let planner = FormatPlanner::default();
        assert_eq!(planner.plan(&m, Some(10_000_000)), None);

        let selection = planner.select(&m, Some(10_000_000));
        assert_eq!(selection.format_spec(), GENERIC_FORMAT_EXPRESSION);
        assert_eq!(selection.merge_container(), Some("mp4"));
    }

    #[test]
    fn test_pair_over_combined_budget_yields_no_plan() {
        let m = meta(vec![
            video_only("v", "avc1.640028", 1080, Some(8_000_000)),
            audio_only("a", 128.0, Some(3_000_000)),
        ]);
        assert_eq!(FormatPlanner::default().plan(&m, Some(10_000_000)), None);
    }

    #[test]
    fn test_pair_with_unknown_half_skips_combined_check() {
        let m = meta(vec![
            video_only("v", "avc1.640028", 1080, Some(8_000_000)),
            audio_only("a", 128.0, None),
        ]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        assert_eq!(plan.format_spec, "v+a");
    }

    #[test]
    fn test_size_agnostic_flag_keeps_oversized_progressive() {
        let m = meta(vec![progressive("22", "avc1.64001F", 720, Some(12_000_000))]);
        let planner = FormatPlanner::new(PlannerSettings {
            size_aware: false,
            ..Default::default()
        });
        assert_eq!(planner.plan(&m, Some(10_000_000)), Some(DownloadPlan::progressive("22")));
    }

    #[test]
    fn test_h264_preference() {
        let m = meta(vec![
            progressive("vp", "vp9", 720, Some(1_000)),
            progressive("avc", "avc1.64001F", 720, Some(1_000)),
        ]);
        let plan = FormatPlanner::default().plan(&m, None).unwrap();
        assert_eq!(plan.format_spec, "avc");
    }

    #[test]
    fn test_codec_rank_outweighs_height() {
        let m = meta(vec![
            progressive("vp", "vp9", 1080, None),
            progressive("avc", "avc1.64001F", 480, None),
        ]);
        let plan = FormatPlanner::default().plan(&m, None).unwrap();
        assert_eq!(plan.format_spec, "avc");
    }

    #[test]
    fn test_ties_keep_first_format() {
        let m = meta(vec![
            progressive("first", "avc1.64001F", 720, Some(1_000)),
            progressive("second", "avc1.64001F", 720, Some(1_000)),
        ]);
        let plan = FormatPlanner::default().plan(&m, None).unwrap();
        assert_eq!(plan.format_spec, "first");
    }

    #[test]
    fn test_greedy_pair_steps_down_video() {
        let m = meta(vec![
            video_only("1080", "avc1.640028", 1080, Some(9_500_000)),
            video_only("720", "avc1.4d401f", 720, Some(6_000_000)),
            audio_only("hi", 160.0, Some(3_000_000)),
            audio_only("lo", 48.0, Some(400_000)),
        ]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        // 1080 + lo fits (9.9 MB), and 1080 outranks 720
        assert_eq!(plan.format_spec, "1080+lo");
    }

    #[test]
    fn test_unknown_size_progressive_used_after_sized_stages() {
        let m = meta(vec![FormatDescriptor {
            bitrate: None,
            ..progressive("nosize", "avc1.64001F", 720, None)
        }]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        assert_eq!(plan.format_spec, "nosize");
    }

    #[test]
    fn test_estimates_ignored_unless_trusted() {
        // 120 s at 1000 kbps is an estimated 15 MB
        let m = meta(vec![progressive("est", "avc1.64001F", 720, None)]);

        let lenient = FormatPlanner::default();
        assert_eq!(lenient.plan(&m, Some(10_000_000)), Some(DownloadPlan::progressive("est")));

        let strict = FormatPlanner::new(PlannerSettings {
            trust_estimates: true,
            ..Default::default()
        });
        assert_eq!(strict.plan(&m, Some(10_000_000)), None);
    }

    #[test]
    fn test_size_estimate_formula() {
        let f = FormatDescriptor {
            bitrate: Some(800.0),
            ..Default::default()
        };
        assert_eq!(format_size(&f, Some(10)), SizeInfo::Estimated(1_000_000));
        assert_eq!(format_size(&f, None), SizeInfo::Unknown);
    }

    #[test]
    fn test_plan_ids_exist_in_metadata() {
        let m = meta(vec![
            video_only("137", "avc1.640028", 1080, Some(4_000_000)),
            audio_only("140", 128.0, Some(1_000_000)),
            FormatDescriptor {
                id: "251".to_string(),
                container: "webm".to_string(),
                video_codec: Some("none".to_string()),
                audio_codec: Some("opus".to_string()),
                audio_bitrate: Some(160.0),
                ..Default::default()
            },
        ]);
        let plan = FormatPlanner::default().plan(&m, Some(10_000_000)).unwrap();
        for id in plan.format_ids() {
            assert!(m.format(id).is_some(), "unknown id {id}");
        }
        assert_eq!(plan.format_spec, "137+140");
    }

    #[test]
    fn test_empty_metadata_has_no_plan() {
        assert_eq!(FormatPlanner::default().plan(&MediaMetadata::default(), None), None);
    }
}
