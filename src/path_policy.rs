//! Naming and destination layout rules. Nothing in here touches the disk.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::descriptor::format_content_version;
use crate::errors::{VaultError, VaultResult};

pub const MAX_NAME_LEN: usize = 200;
pub const NAME_PLACEHOLDER: &str = "Unknown";
pub const UNKNOWN_GAME: &str = "Unknown Game";

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

static APP_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[-_]?app\d*$").expect("static regex"));

/// Where an item lands below the destination root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `<title>/<id>`
    #[default]
    GameAndId,
    GameOnly,
    IdOnly,
    /// `etaHEN/games/<title>`
    Etahen,
    /// `games/<title>`
    ItemzFlow,
    /// `homebrew/<title>`
    DumpRunner,
    /// `<custom name>`, single item only
    Custom,
}

impl FromStr for Layout {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "game-and-id" | "game-id" | "game-ppsa" => Ok(Layout::GameAndId),
            "game-only" => Ok(Layout::GameOnly),
            "id-only" | "ppsa-only" => Ok(Layout::IdOnly),
            "etahen" => Ok(Layout::Etahen),
            "itemzflow" | "itemz-flow" => Ok(Layout::ItemzFlow),
            "dump-runner" | "dumprunner" => Ok(Layout::DumpRunner),
            "custom" => Ok(Layout::Custom),
            other => Err(VaultError::InvalidRequest(format!("unknown layout '{other}'"))),
        }
    }
}

/// What to do when the computed target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    Skip,
    Overwrite,
    #[default]
    RenameUnique,
}

impl FromStr for ConflictPolicy {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(ConflictPolicy::Skip),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "rename" | "rename-unique" => Ok(ConflictPolicy::RenameUnique),
            other => Err(VaultError::InvalidRequest(format!(
                "unknown conflict policy '{other}'"
            ))),
        }
    }
}

/// The naming facts of one content unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamingInput<'a> {
    pub display_title: Option<&'a str>,
    pub folder_name: Option<&'a str>,
    pub identity: Option<&'a str>,
    /// Basename of the folder actually being transferred.
    pub source_basename: Option<&'a str>,
    pub content_version: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NamingOptions<'a> {
    pub layout: Layout,
    pub custom_name: Option<&'a str>,
    /// Append ` (vX.YY)` to titles of non-1.00 releases.
    pub version_suffix: bool,
}

/// Removes control and reserved characters, trims and bounds the length.
/// Never returns an empty string.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() && !RESERVED_CHARS.contains(c))
        .collect();
    let bounded: String = cleaned.trim().chars().take(MAX_NAME_LEN).collect();
    let bounded = bounded.trim_end();
    if bounded.is_empty() {
        NAME_PLACEHOLDER.to_string()
    } else {
        bounded.to_string()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Strips a trailing `-app`, `_app0`, `app12`… from a folder name.
pub fn clean_folder_name(name: &str) -> String {
    let stripped = APP_SUFFIX_RE.replace(name, "");
    let stripped = stripped.trim_end_matches(['-', '_']);
    if stripped.is_empty() {
        name.to_string()
    } else {
        stripped.to_string()
    }
}

pub fn safe_title(input: &NamingInput<'_>, version_suffix: bool) -> String {
    let mut name = non_blank(input.display_title)
        .or_else(|| non_blank(input.folder_name))
        .or_else(|| non_blank(input.identity))
        .unwrap_or(UNKNOWN_GAME)
        .to_string();
    if version_suffix {
        if let Some(short) = input.content_version.and_then(format_content_version) {
            if short != "1.00" {
                name = format!("{name} (v{short})");
            }
        }
    }
    sanitize_name(&name)
}

pub fn identity_name(input: &NamingInput<'_>) -> String {
    if let Some(identity) = non_blank(input.identity) {
        return sanitize_name(identity);
    }
    let base = non_blank(input.source_basename)
        .or_else(|| non_blank(input.folder_name))
        .unwrap_or(UNKNOWN_GAME);
    sanitize_name(&clean_folder_name(base))
}

/// Path segments of the target below the destination root.
pub fn target_segments(input: &NamingInput<'_>, options: &NamingOptions<'_>) -> VaultResult<Vec<String>> {
    let title = || safe_title(input, options.version_suffix);
    let segments = match options.layout {
        Layout::IdOnly => vec![identity_name(input)],
        Layout::GameOnly => vec![title()],
        Layout::Etahen => vec!["etaHEN".into(), "games".into(), title()],
        Layout::ItemzFlow => vec!["games".into(), title()],
        Layout::DumpRunner => vec!["homebrew".into(), title()],
        Layout::Custom => {
            let custom = non_blank(options.custom_name).ok_or_else(|| {
                VaultError::InvalidRequest("custom layout requires a name".into())
            })?;
            vec![sanitize_name(custom)]
        }
        Layout::GameAndId => vec![title(), identity_name(input)],
    };
    Ok(segments)
}

pub fn compute_target(
    dest_root: &Path,
    input: &NamingInput<'_>,
    options: &NamingOptions<'_>,
) -> VaultResult<PathBuf> {
    let mut target = dest_root.to_path_buf();
    for segment in target_segments(input, options)? {
        target.push(segment);
    }
    Ok(target)
}

/// Whether a unique name keeps a file extension after the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Dir,
    File,
}

/// Returns `name` if free, otherwise `name (1)`, `name (2)`, …
pub fn unique_name<F>(name: &str, kind: NameKind, max_attempts: u32, mut taken: F) -> VaultResult<String>
where
    F: FnMut(&str) -> bool,
{
    if !taken(name) {
        return Ok(name.to_string());
    }
    let (stem, ext) = match kind {
        NameKind::File => match name.rfind('.') {
            Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
            _ => (name, ""),
        },
        NameKind::Dir => (name, ""),
    };
    for i in 1..=max_attempts {
        let candidate = format!("{stem} ({i}){ext}");
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(VaultError::UniqueNameExhausted(name.to_string(), max_attempts))
}

pub fn ensure_unique_target<F>(base: &Path, max_attempts: u32, mut exists: F) -> VaultResult<PathBuf>
where
    F: FnMut(&Path) -> bool,
{
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VaultError::InvalidPath(format!("{} has no file name", base.display())))?;
    let parent = base.parent().unwrap_or_else(|| Path::new(""));
    let chosen = unique_name(&name, NameKind::Dir, max_attempts, |candidate| {
        exists(&parent.join(candidate))
    })?;
    Ok(parent.join(chosen))
}

/// Absolute, with `.` and `..` resolved textually.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn overlap(source: &Path, target: &Path) -> Option<&'static str> {
    if source == target {
        None
    } else if source.starts_with(target) {
        Some("target contains the source")
    } else if target.starts_with(source) {
        Some("target is inside the source")
    } else {
        None
    }
}

/// Rejects targets that are a strict ancestor or descendant of the source.
/// Equal paths pass; conflict handling deals with them.
pub fn check_overlap(source: &Path, target: &Path) -> VaultResult<()> {
    let source = normalize_lexically(source);
    let target = normalize_lexically(target);
    match overlap(&source, &target) {
        Some(reason) => Err(VaultError::PathOverlap {
            source_path: source.display().to_string(),
            target_path: target.display().to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Same rule for two paths on one FTP server.
pub fn check_overlap_remote(source: &str, target: &str) -> VaultResult<()> {
    let source = crate::ftp::normalize_remote(source);
    let target = crate::ftp::normalize_remote(target);
    match overlap(Path::new(&source), Path::new(&target)) {
        Some(reason) => Err(VaultError::PathOverlap {
            source_path: source,
            target_path: target,
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn game_a() -> NamingInput<'static> {
        NamingInput {
            display_title: Some("Game A"),
            folder_name: Some("GameA"),
            identity: Some("PPSA00001"),
            source_basename: Some("GameA"),
            content_version: Some("01.000.000"),
        }
    }

    fn options(layout: Layout) -> NamingOptions<'static> {
        NamingOptions {
            layout,
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_strips_reserved() {
        let out = sanitize_name("  Spider<Man>: Miles/Morales?\u{7}  ");
        assert_eq!(out, "SpiderMan MilesMorales");
        for c in RESERVED_CHARS {
            assert!(!out.contains(*c));
        }
    }

    #[test]
    fn test_sanitize_bounds_and_placeholder() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_name(&long).chars().count(), MAX_NAME_LEN);
        assert_eq!(sanitize_name(""), NAME_PLACEHOLDER);
        assert_eq!(sanitize_name("<>:\"/\\|?*"), NAME_PLACEHOLDER);
        assert_eq!(sanitize_name("\u{0}\u{1f}"), NAME_PLACEHOLDER);
    }

    #[test]
    fn test_sanitize_multibyte_truncation() {
        let long = "ゲーム".repeat(100);
        let out = sanitize_name(&long);
        assert_eq!(out.chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_layouts() {
        let dest = Path::new("/dst");
        let cases = [
            (Layout::GameAndId, "/dst/Game A/PPSA00001"),
            (Layout::GameOnly, "/dst/Game A"),
            (Layout::IdOnly, "/dst/PPSA00001"),
            (Layout::Etahen, "/dst/etaHEN/games/Game A"),
            (Layout::ItemzFlow, "/dst/games/Game A"),
            (Layout::DumpRunner, "/dst/homebrew/Game A"),
        ];
        for (layout, expected) in cases {
            let target = compute_target(dest, &game_a(), &options(layout)).unwrap();
            assert_eq!(target, PathBuf::from(expected), "{layout:?}");
        }
    }

    #[test]
    fn test_compute_target_is_deterministic() {
        let dest = Path::new("/dst");
        let a = compute_target(dest, &game_a(), &options(Layout::GameAndId)).unwrap();
        let b = compute_target(dest, &game_a(), &options(Layout::GameAndId)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_layout() {
        let opts = NamingOptions {
            layout: Layout::Custom,
            custom_name: Some("My: Copy"),
            version_suffix: false,
        };
        let target = compute_target(Path::new("/dst"), &game_a(), &opts).unwrap();
        assert_eq!(target, PathBuf::from("/dst/My Copy"));

        let missing = NamingOptions {
            layout: Layout::Custom,
            custom_name: Some("   "),
            version_suffix: false,
        };
        assert!(matches!(
            compute_target(Path::new("/dst"), &game_a(), &missing),
            Err(VaultError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_identity_name_falls_back_to_clean_folder() {
        let input = NamingInput {
            source_basename: Some("MyGame-app0"),
            ..Default::default()
        };
        assert_eq!(identity_name(&input), "MyGame");
        let input = NamingInput {
            source_basename: Some("app"),
            ..Default::default()
        };
        assert_eq!(identity_name(&input), "app");
    }

    #[test]
    fn test_title_fallbacks() {
        let input = NamingInput {
            identity: Some("PPSA01234"),
            ..Default::default()
        };
        assert_eq!(safe_title(&input, false), "PPSA01234");
        assert_eq!(safe_title(&NamingInput::default(), false), UNKNOWN_GAME);
    }

    #[test]
    fn test_version_suffix_only_for_updates() {
        let mut input = game_a();
        assert_eq!(safe_title(&input, true), "Game A");
        input.content_version = Some("01.050.000");
        assert_eq!(safe_title(&input, true), "Game A (v1.05)");
        assert_eq!(safe_title(&input, false), "Game A");
    }

    #[test]
    fn test_unique_name_sequence() {
        let mut taken: HashSet<String> = ["X".to_string()].into_iter().collect();
        let first = unique_name("X", NameKind::Dir, 100, |n| taken.contains(n)).unwrap();
        assert_eq!(first, "X (1)");
        taken.insert(first);
        let second = unique_name("X", NameKind::Dir, 100, |n| taken.contains(n)).unwrap();
        assert_eq!(second, "X (2)");
    }

    #[test]
    fn test_unique_name_keeps_extension_for_files() {
        let name = unique_name("data.bin", NameKind::File, 10, |n| n == "data.bin").unwrap();
        assert_eq!(name, "data (1).bin");
        let name = unique_name(".hidden", NameKind::File, 10, |n| n == ".hidden").unwrap();
        assert_eq!(name, ".hidden (1)");
    }

    #[test]
    fn test_unique_name_is_bounded() {
        let err = unique_name("X", NameKind::Dir, 5, |_| true).unwrap_err();
        assert!(matches!(err, VaultError::UniqueNameExhausted(_, 5)));
    }

    #[test]
    fn test_ensure_unique_target() {
        let base = Path::new("/dst/Game A");
        let existing: HashSet<PathBuf> = [PathBuf::from("/dst/Game A")].into_iter().collect();
        let out = ensure_unique_target(base, 100, |p| existing.contains(p)).unwrap();
        assert_eq!(out, PathBuf::from("/dst/Game A (1)"));
    }

    #[test]
    fn test_overlap_guard() {
        assert!(check_overlap(Path::new("/a/b/c"), Path::new("/a/b")).is_err());
        assert!(check_overlap(Path::new("/a/b"), Path::new("/a/b/c")).is_err());
        assert!(check_overlap(Path::new("/a/b"), Path::new("/a/bc")).is_ok());
        assert!(check_overlap(Path::new("/a/b"), Path::new("/x/b")).is_ok());
        assert!(check_overlap(Path::new("/a/b"), Path::new("/a/b")).is_ok());
        assert!(check_overlap(Path::new("/a/b/../c"), Path::new("/a/c/d")).is_err());
    }

    #[test]
    fn test_remote_overlap_guard() {
        assert!(check_overlap_remote("/mnt/ext1/games/X", "/mnt/ext1/games").is_err());
        assert!(check_overlap_remote("/mnt/ext1/games/X", "/mnt/usb0/games/X").is_ok());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ppsa-only".parse::<Layout>().unwrap(), Layout::IdOnly);
        assert_eq!("etahen".parse::<Layout>().unwrap(), Layout::Etahen);
        assert!("nope".parse::<Layout>().is_err());
        assert_eq!("rename".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::RenameUnique);
    }
}
