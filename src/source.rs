// URL helpers: first-link extraction and source classification

use regex::Regex;
use url::Url;

use crate::downloader::SourceCategory;

const YOUTUBE_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "m.youtube.com"];
const INSTAGRAM_DOMAINS: &[&str] = &["instagram.com", "instagr.am"];

const DISPLAY_NAMES: &[(&[&str], &str)] = &[
    (YOUTUBE_DOMAINS, "YouTube"),
    (INSTAGRAM_DOMAINS, "Instagram"),
    (&["tiktok.com"], "TikTok"),
    (&["vk.com", "vkvideo.ru"], "VK"),
    (&["twitter.com", "x.com"], "X"),
    (&["facebook.com", "fb.watch"], "Facebook"),
    (&["t.me"], "Telegram"),
];

/// Lowercased host with `www.` removed, empty when the URL has none.
fn host(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .map(|h| h.replace("www.", ""))
        .unwrap_or_default()
}

fn matches_any(host: &str, domains: &[&str]) -> bool {
    !host.is_empty()
        && domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
}

pub fn classify(url: &str) -> SourceCategory {
    let host = host(url);
    if matches_any(&host, YOUTUBE_DOMAINS) {
        SourceCategory::YouTube
    } else if matches_any(&host, INSTAGRAM_DOMAINS) {
        SourceCategory::Instagram
    } else {
        SourceCategory::Generic
    }
}

/// Human-readable site name used in captions.
pub fn display_name(url: &str) -> String {
    let host = host(url);
    if let Some((_, name)) = DISPLAY_NAMES.iter().find(|(d, _)| matches_any(&host, d)) {
        return name.to_string();
    }
    if host.is_empty() {
        "Unknown".to_string()
    } else {
        host
    }
}

/// First `http(s)://` link in `text`, trailing punctuation stripped.
/// Links without a host are ignored.
pub fn extract_first_url(text: &str) -> Option<String> {
    lazy_static::lazy_static! {
        static ref URL_RE: Regex = Regex::new(r"https?://\S+").unwrap();
    }

    let found = URL_RE.find(text.trim())?;
    let candidate = found
        .as_str()
        .trim_end_matches(|c: char| ").,]}>\"'".contains(c));

    let parsed = Url::parse(candidate).ok()?;
    parsed.host_str().filter(|h| !h.is_empty())?;
    Some(candidate.to_string())
}
