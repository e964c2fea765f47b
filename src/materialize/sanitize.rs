//! Media-name sanitization and collision handling
//!
//! Release names arrive as `Movie.Title.2024.1080p.x264-GROUP.mkv`; the media
//! server wants `Movie Title (2024).mkv`. The pipeline is: strip the release
//! group after the last dash, split on separator characters, drop quality
//! tokens, pull the trailing year out, scrub filesystem-reserved characters
//! and reassemble.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Quality/source tokens removed from names, compared case-insensitively.
const TOKEN_BLOCKLIST: &[&str] = &[
    "720p", "1080p", "2160p", "4k", "bluray", "web-dl", "webdl", "webrip", "x264", "x265",
    "h264", "h265", "h.264", "h.265", "hevc", "xvid", "remux", "proper", "repack", "rerip",
];

/// Characters that never appear in produced file names.
const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(19|20)\d{2}$").unwrap_or_else(|_| unreachable!()))
}

/// Produce a clean `Title (YYYY).ext` (or `Title.ext`) from an archive entry
/// name.
pub fn sanitize_media_name(file_name: &str) -> String {
    let (base, ext) = match file_name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, Some(ext)),
        _ => (file_name, None),
    };

    let base = strip_release_group(base);

    let mut title_tokens: Vec<String> = Vec::new();
    let mut year: Option<String> = None;

    let tokens: Vec<&str> = base
        .split(['.', '_', ' '])
        .filter(|t| !t.is_empty())
        .collect();

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        let lower = token.to_lowercase();

        // "H.264" arrives split into "H" + "264" by the separator pass.
        if (lower == "h") && i + 1 < tokens.len() && matches!(tokens[i + 1], "264" | "265") {
            i += 2;
            continue;
        }
        if TOKEN_BLOCKLIST.contains(&lower.as_str()) {
            i += 1;
            continue;
        }
        if year_re().is_match(token) {
            // Trailing year wins; an earlier year stays in the title.
            if let Some(previous) = year.take() {
                title_tokens.push(previous);
            }
            year = Some(token.to_string());
            i += 1;
            continue;
        }

        let scrubbed: String = token.chars().filter(|c| !RESERVED.contains(c)).collect();
        if !scrubbed.is_empty() {
            title_tokens.push(scrubbed);
        }
        i += 1;
    }

    let mut title = title_tokens.join(" ");
    if title.is_empty() {
        title = base.chars().filter(|c| !RESERVED.contains(c)).collect();
        if title.is_empty() {
            title = "unnamed".to_string();
        }
    }

    let mut name = match year {
        Some(year) => format!("{title} ({year})"),
        None => title,
    };
    if let Some(ext) = ext {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// Pointer-file name for an entry: sanitized, with the extension forced to
/// `.strm`.
pub fn pointer_name(file_name: &str) -> String {
    let sanitized = sanitize_media_name(file_name);
    match sanitized.rsplit_once('.') {
        Some((base, _ext)) if !base.is_empty() => format!("{base}.strm"),
        _ => format!("{sanitized}.strm"),
    }
}

/// Strip a `-GROUP` suffix.
///
/// Only fires when the tail after the last dash looks like a group tag (no
/// separators) and the head still carries separators, so hyphenated titles
/// like `Spider-Man` survive.
fn strip_release_group(base: &str) -> &str {
    let Some(idx) = base.rfind('-') else {
        return base;
    };
    let (head, tail) = (&base[..idx], &base[idx + 1..]);
    let tail_is_tag = !tail.is_empty() && !tail.contains(['.', '_', ' ']);
    let head_has_separators = head.contains(['.', '_', ' ']);
    if tail_is_tag && head_has_separators {
        head
    } else {
        base
    }
}

/// Lowest free path for `file_name` inside `dir`.
///
/// The first collision gets ` (2)`, the next ` (3)`, and so on; existing
/// files are never overwritten.
pub fn unique_target_path(dir: &Path, file_name: &str) -> crate::error::Result<PathBuf> {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    for n in 2..=9999u32 {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(crate::error::Error::Io(std::io::Error::other(format!(
        "no free name for {file_name} in {}",
        dir.display()
    ))))
}
