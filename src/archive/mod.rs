//! Archive set model and entry filtering
//!
//! A logical archive is a set of volume files sharing a stem under one of two
//! naming conventions: the legacy `name.rar`, `name.r00`, `name.r01`, ... and
//! the newer `name.part01.rar`, `name.part02.rar`, ... The first volume
//! (`.rar` in both schemes) is the handle used for all reads.

pub mod reader;

pub use reader::{ArchiveEntry, EntryReader, RarSession};

use std::path::{Path, PathBuf};

/// Entry suffixes exposed to the media server.
///
/// Everything else inside an archive (`.nfo`, `.txt`, checksums, ...) is
/// skipped, as is anything whose name contains `sample`.
const MEDIA_EXTENSIONS: &[&str] = &[
    // video
    "mkv", "mp4", "avi", "mov", "m4v", "flv", "wmv", "m2ts", "ts", "webm", "mpg", "mpeg",
    // audio
    "mp3", "flac", "aac", "ogg", "m4a", "wav", "opus",
    // image
    "jpg", "jpeg", "png",
    // subtitle
    "srt", "ass", "ssa", "sub", "vtt",
];

/// All volume files belonging to one logical archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSet {
    /// The `.rar` volume all reads go through
    pub first_volume: PathBuf,
    /// Every volume of the set present on disk, first volume included
    pub volumes: Vec<PathBuf>,
    /// Shared name stem of the set
    pub stem: String,
}

impl ArchiveSet {
    /// Resolve the volume set around a first volume by scanning its directory.
    ///
    /// Only volumes that currently exist are included; completeness is judged
    /// later by the reader when it opens the set.
    pub fn resolve(first_volume: &Path) -> Self {
        let stem = set_stem(first_volume);
        let parent = first_volume.parent().unwrap_or_else(|| Path::new("."));

        let file_name = first_volume
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let volumes = if file_name.contains(".part") {
            resolve_part_volumes(parent, &stem)
        } else {
            resolve_legacy_volumes(parent, &stem)
        };

        let volumes = if volumes.is_empty() {
            vec![first_volume.to_path_buf()]
        } else {
            volumes
        };

        Self {
            first_volume: first_volume.to_path_buf(),
            volumes,
            stem,
        }
    }

    /// Queue-wide identity of the set.
    pub fn handle(&self) -> &Path {
        &self.first_volume
    }

    /// Combined on-disk size of all present volumes, in bytes.
    pub fn total_size(&self) -> u64 {
        self.volumes
            .iter()
            .filter_map(|v| std::fs::metadata(v).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// `name.part01.rar` style: collect every `stem.partNN.rar`, ordered by part
/// number.
fn resolve_part_volumes(parent: &Path, stem: &str) -> Vec<PathBuf> {
    let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
    let Ok(entries) = std::fs::read_dir(parent) else {
        return Vec::new();
    };
    let prefix = format!("{}.part", stem.to_lowercase());
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_lowercase();
        if let Some(rest) = lower.strip_prefix(&prefix) {
            if let Some(digits) = rest.strip_suffix(".rar") {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(n) = digits.parse::<u32>() {
                        numbered.push((n, path));
                    }
                }
            }
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    numbered.into_iter().map(|(_, p)| p).collect()
}

/// Legacy style: `stem.rar` followed by `stem.r00` .. `stem.r99`.
fn resolve_legacy_volumes(parent: &Path, stem: &str) -> Vec<PathBuf> {
    let mut volumes = Vec::new();
    let rar = parent.join(format!("{stem}.rar"));
    if rar.exists() {
        volumes.push(rar);
    }
    for i in 0..100 {
        let vol = parent.join(format!("{stem}.r{i:02}"));
        if vol.exists() {
            volumes.push(vol);
        }
    }
    volumes
}

/// Whether this file is the first volume of an archive set.
///
/// `.partN.rar` sets start at part 1 (any zero padding); legacy sets start at
/// the bare `.rar`.
pub fn is_first_volume(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_lowercase();
    if let Some(part) = part_number(&name) {
        return part == 1;
    }
    name.ends_with(".rar")
}

/// Shared stem of the set a volume file belongs to.
pub fn set_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = name.to_lowercase();
    if let Some(idx) = lower.rfind(".part") {
        let tail = &lower[idx + 5..];
        if tail
            .strip_suffix(".rar")
            .is_some_and(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()))
        {
            return name[..idx].to_string();
        }
    }
    match name.rsplit_once('.') {
        Some((stem, _ext)) => stem.to_string(),
        None => name,
    }
}

/// Map any touched volume file (`.rar`, `.rNN`, `.partNN.rar`) to its set
/// stem; `None` for files that are not RAR volumes.
pub fn volume_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    if name.ends_with(".rar") {
        return Some(set_stem(path));
    }
    if let Some((_, ext)) = name.rsplit_once('.') {
        if ext.len() == 3
            && ext.starts_with('r')
            && ext[1..].chars().all(|c| c.is_ascii_digit())
        {
            return Some(set_stem(path));
        }
    }
    None
}

/// Locate the first volume of a set inside a directory, if present.
pub fn find_first_volume(dir: &Path, stem: &str) -> Option<PathBuf> {
    let plain = dir.join(format!("{stem}.rar"));
    if plain.exists() {
        return Some(plain);
    }
    for candidate in ["part1.rar", "part01.rar", "part001.rar"] {
        let p = dir.join(format!("{stem}.{candidate}"));
        if p.exists() {
            return Some(p);
        }
    }
    None
}

/// Part number of a `.partNN.rar` file name (already lowercased), if any.
fn part_number(lower_name: &str) -> Option<u32> {
    let idx = lower_name.rfind(".part")?;
    let digits = lower_name[idx + 5..].strip_suffix(".rar")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Whether an entry name is a media candidate (recognized suffix, not a
/// sample).
pub fn is_media_entry(entry_path: &Path) -> bool {
    let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.to_lowercase().contains("sample") {
        return false;
    }
    entry_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Configurable size bounds applied after the media-suffix filter.
#[derive(Clone, Copy, Debug)]
pub struct EntryFilter {
    /// Entries below this are skipped
    pub min_size: u64,
    /// Entries above this are skipped
    pub max_size: u64,
}

impl EntryFilter {
    /// Why this entry is skipped, or `None` if it survives the filter.
    pub fn skip_reason(&self, entry: &ArchiveEntry) -> Option<&'static str> {
        if !is_media_entry(&entry.path) {
            return Some("not a media file");
        }
        if entry.size < self.min_size {
            return Some("below minimum size");
        }
        if entry.size > self.max_size {
            return Some("above maximum size");
        }
        None
    }
}
