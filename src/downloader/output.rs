// Output resolution and per-job cleanup
//
// Every file a job produces is named `<prefix>.<something>`; the dot after
// the prefix is the token boundary, so prefix `abc` never touches `abcdef.mp4`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, warn};

use super::models::DownloadOutcome;

/// True when `name` is one of the files of `prefix`.
pub fn belongs_to_prefix(name: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// Partial downloads, unmerged fragments and temp files.
pub fn is_intermediate(name: &str) -> bool {
    lazy_static::lazy_static! {
        static ref FRAGMENT_RE: Regex = Regex::new(r"\.f[0-9]+\.").unwrap();
    }

    let lower = name.to_lowercase();
    lower.ends_with(".part")
        || lower.ends_with(".ytdl")
        || lower.ends_with(".temp")
        || lower.ends_with(".tmp")
        || lower.contains(".part-frag")
        || lower.contains(".temp.")
        || FRAGMENT_RE.is_match(&lower)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Regular, non-empty file.
fn is_usable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Files of `prefix` in `folder`, sorted by name for stable results.
fn prefix_files(prefix: &str, folder: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(folder = %folder.display(), error = %e, "cannot list output folder");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| file_name(p).is_some_and(|n| belongs_to_prefix(n, prefix)))
        .collect();
    files.sort();
    files
}

/// Locate the delivered file for a finished download.
///
/// Order: the reported final file, then the reported per-format files
/// (skipping intermediates and audio-only entries), then `prefix.<ext>` in
/// the folder, then any finished file of the prefix (target container first,
/// newest otherwise).
pub fn resolve(
    outcome: &DownloadOutcome,
    prefix: &str,
    folder: &Path,
    target_container: &str,
) -> Option<PathBuf> {
    if let Some(path) = outcome.final_path.as_deref() {
        if is_usable(path) {
            return Some(path.to_path_buf());
        }
    }

    let reported = outcome.requested.iter().find(|f| {
        f.audio_only != Some(true)
            && file_name(&f.path).is_some_and(|n| !is_intermediate(n))
            && is_usable(&f.path)
    });
    if let Some(file) = reported {
        return Some(file.path.clone());
    }

    let candidates: Vec<PathBuf> = prefix_files(prefix, folder)
        .into_iter()
        .filter(|p| file_name(p).is_some_and(|n| !is_intermediate(n)) && is_usable(p))
        .collect();

    let exact = candidates.iter().find(|p| {
        file_name(p)
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
    });
    if let Some(path) = exact {
        return Some(path.clone());
    }

    let newest = |paths: Vec<&PathBuf>| paths.into_iter().max_by_key(|p| modified(p)).cloned();

    let in_target: Vec<&PathBuf> = candidates
        .iter()
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(target_container))
        })
        .collect();

    newest(in_target).or_else(|| newest(candidates.iter().collect()))
}

fn remove_files(files: Vec<PathBuf>) -> usize {
    let mut removed = 0;
    for path in files {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
        }
    }
    removed
}

/// Delete every file of `prefix`. Best-effort, returns how many were removed.
pub fn cleanup(prefix: &str, folder: &Path) -> usize {
    let removed = remove_files(prefix_files(prefix, folder));
    if removed > 0 {
        debug!(prefix, removed, "cleaned up job files");
    }
    removed
}

/// Delete only the leftovers of an interrupted attempt.
pub fn discard_partials(prefix: &str, folder: &Path) -> usize {
    let partials = prefix_files(prefix, folder)
        .into_iter()
        .filter(|p| file_name(p).is_some_and(is_intermediate))
        .collect();
    remove_files(partials)
}
