//! Reading `sce_sys/param.json` descriptors and deriving identity from them.

use regex::Regex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Metadata subdirectory every content root carries.
pub const METADATA_DIR: &str = "sce_sys";
pub const DESCRIPTOR_FILE: &str = "param.json";
/// Cover art names inside the metadata directory, best first.
pub const ICON_CANDIDATES: &[&str] = &[
    "icon0.png",
    "icon0.jpg",
    "icon0.jpeg",
    "icon.png",
    "cover.png",
    "cover.jpg",
    "tile0.png",
];
pub const IDENTITY_PREFIX: &str = "PPSA";

static IDENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)PPSA\d{4,6}").expect("static regex"));
static BARE_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5})\b").expect("static regex"));
static IDENTITY_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^PPSA\d{4,6}(?:[-_].+)?$").expect("static regex"));
static ICON_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(icon0|icon|cover|tile0)\.(png|jpg|jpeg)$").expect("static regex")
});
static SDK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0[xX]([0-9A-Fa-f]{2})").expect("static regex"));
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static regex"));

/// Parsed descriptor. Every field is optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    pub title_name: Option<String>,
    /// `localizedParameters` entries in file order: locale tag and its title, if any.
    pub localized: Vec<(String, Option<String>)>,
    pub content_id: Option<String>,
    pub content_version: Option<String>,
    pub sdk_version: Option<String>,
    pub default_language: Option<String>,
    pub sku_hint: Option<String>,
    /// Compact re-serialization, searched for an identity when `content_id` has none.
    pub raw: String,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Descriptor {
    /// Builds a descriptor from descriptor text. `None` unless the text is a JSON object.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let value: Value = serde_json::from_str(text).ok()?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let mut localized = Vec::new();
        let mut localized_default = None;
        if let Some(map) = value.get("localizedParameters").and_then(Value::as_object) {
            for (key, entry) in map {
                if key == "defaultLanguage" {
                    localized_default = entry.as_str().map(str::to_string);
                    continue;
                }
                localized.push((key.clone(), string_field(entry, "titleName")));
            }
        }
        Some(Self {
            title_name: string_field(value, "titleName"),
            localized,
            content_id: string_field(value, "contentId"),
            content_version: string_field(value, "contentVersion"),
            sdk_version: string_field(value, "sdkVersion")
                .or_else(|| string_field(value, "requiredSystemSoftwareVersion")),
            default_language: string_field(value, "defaultLanguage").or(localized_default),
            sku_hint: find_sku(value),
            raw: value.to_string(),
        })
    }

    /// Identity from the content id, else from anywhere in the descriptor.
    pub fn identity_key(&self) -> Option<String> {
        self.content_id
            .as_deref()
            .and_then(extract_identity_key)
            .or_else(|| extract_identity_key(&self.raw))
    }

    pub fn display_title(&self) -> Option<String> {
        resolve_display_title(self, None)
    }

    fn localized_title(&self, key: &str) -> Option<&str> {
        self.localized
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, title)| title.as_deref())
    }
}

/// Reads and parses a descriptor. Any I/O or parse failure yields `None`.
pub async fn read_descriptor(path: &Path) -> Option<Descriptor> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            debug!("Cannot read descriptor {:?}: {}", path, e);
            return None;
        }
    };
    let parsed = Descriptor::parse(&text);
    if parsed.is_none() {
        debug!("Descriptor {:?} is not a JSON object", path);
    }
    parsed
}

/// Picks the best title for `preferred_region`, falling back through
/// the descriptor's default language, language prefix, English, then any.
pub fn resolve_display_title(desc: &Descriptor, preferred_region: Option<&str>) -> Option<String> {
    if let Some(title) = &desc.title_name {
        return Some(title.clone());
    }
    if desc.localized.is_empty() {
        return None;
    }
    let region = preferred_region
        .or(desc.default_language.as_deref())
        .unwrap_or("en-US")
        .trim();

    if let Some(title) = desc.localized_title(region) {
        return Some(title.to_string());
    }
    if !region.is_empty() {
        let upper = region.to_ascii_uppercase();
        let region_suffix = format!("-{upper}");
        for (key, title) in &desc.localized {
            let Some(title) = title else { continue };
            let key_upper = key.to_ascii_uppercase();
            if key_upper == upper || (region.len() == 2 && key_upper.ends_with(&region_suffix)) {
                return Some(title.clone());
            }
        }
    }
    let language = match region.split_once('-') {
        Some((lang, _)) => Some(lang),
        None if region.len() == 2 => Some(region),
        None => None,
    };
    if let Some(lang) = language.map(str::to_ascii_lowercase) {
        for (key, title) in &desc.localized {
            if let Some(title) = title {
                if key.to_ascii_lowercase().starts_with(&lang) {
                    return Some(title.clone());
                }
            }
        }
    }
    for fallback in ["en-US", "en-GB"] {
        if let Some(title) = desc.localized_title(fallback) {
            return Some(title.to_string());
        }
    }
    desc.localized
        .iter()
        .find_map(|(_, title)| title.clone())
}

/// `PPSA` followed by 4-6 digits, uppercased; a lone 5-digit number gets the prefix.
pub fn extract_identity_key(text: &str) -> Option<String> {
    if let Some(m) = IDENTITY_RE.find(text) {
        return Some(m.as_str().to_ascii_uppercase());
    }
    BARE_DIGITS_RE
        .captures(text)
        .map(|caps| format!("{IDENTITY_PREFIX}{}", &caps[1]))
}

/// Matches identity-named folders such as `PPSA01234` or `PPSA01234-app`.
pub fn is_identity_dir_name(name: &str) -> bool {
    IDENTITY_DIR_RE.is_match(name)
}

pub fn is_metadata_dir_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(METADATA_DIR)
}

pub fn is_icon_name(name: &str) -> bool {
    ICON_NAME_RE.is_match(name)
}

/// Keeps ASCII alphanumerics, uppercased.
pub fn normalize_sku(raw: &str) -> Option<String> {
    let sku: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!sku.is_empty()).then_some(sku)
}

/// First string under a key containing "sku", searched depth first.
fn find_sku(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, entry) in map {
                if key.to_ascii_lowercase().contains("sku") {
                    if let Some(sku) = entry.as_str().and_then(normalize_sku) {
                        return Some(sku);
                    }
                }
            }
            map.values().find_map(find_sku)
        }
        Value::Array(items) => items.iter().find_map(find_sku),
        _ => None,
    }
}

/// Nearest ancestor (or self) named like an identity folder, at most
/// `max_levels` steps up. A `sce_sys` starting point begins at its parent.
pub fn canonical_content_root(candidate: &Path, max_levels: usize) -> Option<PathBuf> {
    let mut current = candidate;
    if current
        .file_name()
        .is_some_and(|n| is_metadata_dir_name(&n.to_string_lossy()))
    {
        current = current.parent()?;
    }
    for _ in 0..=max_levels {
        if current
            .file_name()
            .is_some_and(|n| is_identity_dir_name(&n.to_string_lossy()))
        {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
    None
}

/// `"0x05000000"` -> `"5.xx"`.
pub fn format_sdk_version(raw: &str) -> Option<String> {
    let caps = SDK_RE.captures(raw.trim())?;
    let major = u8::from_str_radix(&caps[1], 16).ok()?;
    Some(format!("{major}.xx"))
}

/// `"01.050.000"` -> `"1.05"`.
pub fn format_content_version(raw: &str) -> Option<String> {
    let mut parts = DIGITS_RE.find_iter(raw).map(|m| m.as_str());
    let major: u32 = parts.next()?.parse().ok()?;
    let minor = parts.next()?;
    let minor = if minor.len() > 2 {
        minor[..2].to_string()
    } else {
        format!("{minor:0>2}")
    };
    Some(format!("{major}.{minor}"))
}

/// Finds a cover image for a content root: the fixed candidates in
/// `sce_sys`, then loose icon files in the root, then a shallow search.
pub async fn find_icon(root: &Path) -> Option<PathBuf> {
    let meta = root.join(METADATA_DIR);
    for candidate in ICON_CANDIDATES {
        let path = meta.join(candidate);
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            return Some(path);
        }
    }
    find_file_bfs(root, 2, is_icon_name).await
}

/// Locates the descriptor below an identity folder: `sce_sys/param.json`,
/// a differently-cased `sce_sys`, then a search down to `max_depth`.
pub async fn find_descriptor_in(root: &Path, max_depth: usize) -> Option<PathBuf> {
    let direct = root.join(METADATA_DIR).join(DESCRIPTOR_FILE);
    if tokio::fs::metadata(&direct).await.is_ok_and(|m| m.is_file()) {
        return Some(direct);
    }
    if let Ok(mut entries) = tokio::fs::read_dir(root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_metadata_dir_name(&name) && entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                let candidate = entry.path().join(DESCRIPTOR_FILE);
                if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_file()) {
                    return Some(candidate);
                }
            }
        }
    }
    find_file_bfs(root, max_depth, |name| {
        name.eq_ignore_ascii_case(DESCRIPTOR_FILE)
    })
    .await
}

async fn find_file_bfs<F>(root: &Path, max_depth: usize, matches: F) -> Option<PathBuf>
where
    F: Fn(&str) -> bool,
{
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_file() {
                files.push((name, entry.path()));
            } else if file_type.is_dir() && !crate::walker::is_default_skipped(&name) {
                dirs.push((name, entry.path()));
            }
        }
        files.sort();
        if let Some((_, path)) = files.into_iter().find(|(name, _)| matches(name)) {
            return Some(path);
        }
        if depth < max_depth {
            dirs.sort();
            queue.extend(dirs.into_iter().map(|(_, path)| (path, depth + 1)));
        }
    }
    None
}
