//! Discovered content units and the dedup pass over them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::ftp::address::FtpEndpoint;
use crate::ftp::normalize_remote;
use crate::path_policy::{normalize_lexically, NamingInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Local,
    Ftp,
}

/// Where a directory lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Location {
    Local { path: PathBuf },
    Ftp { endpoint: FtpEndpoint, path: String },
}

impl Location {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Location::Local { path: path.into() }
    }

    pub fn ftp(endpoint: FtpEndpoint, path: impl Into<String>) -> Self {
        Location::Ftp {
            endpoint,
            path: normalize_remote(&path.into()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Location::Local { .. } => Protocol::Local,
            Location::Ftp { .. } => Protocol::Ftp,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Location::Local { path } => Some(path),
            Location::Ftp { .. } => None,
        }
    }

    pub fn basename(&self) -> Option<String> {
        match self {
            Location::Local { path } => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            Location::Ftp { path, .. } => crate::ftp::remote_basename(path).map(str::to_string),
        }
    }

    /// Same-server scope plus a lowercase normalized path, for nesting checks.
    fn comparable(&self) -> (String, PathBuf) {
        match self {
            Location::Local { path } => (
                "local".to_string(),
                PathBuf::from(normalize_lexically(path).to_string_lossy().to_lowercase()),
            ),
            Location::Ftp { endpoint, path } => (
                format!("{}:{}", endpoint.host.to_lowercase(), endpoint.port),
                PathBuf::from(normalize_remote(path).to_lowercase()),
            ),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { path } => write!(f, "{}", path.display()),
            Location::Ftp { endpoint, path } => write!(f, "{}{}", endpoint.base_url(), path),
        }
    }
}

/// Total payload size of a content root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "bytes", rename_all = "camelCase")]
pub enum ContentSize {
    Exact(u64),
    /// The file-count cap was hit; at least this many bytes.
    AtLeast(u64),
    #[default]
    Unknown,
}

impl ContentSize {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            ContentSize::Exact(n) | ContentSize::AtLeast(n) => Some(*n),
            ContentSize::Unknown => None,
        }
    }
}

impl fmt::Display for ContentSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSize::Exact(n) => write!(f, "{n} B"),
            ContentSize::AtLeast(n) => write!(f, ">= {n} B"),
            ContentSize::Unknown => write!(f, "?"),
        }
    }
}

/// One discovered game-content root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUnit {
    /// Identity, SKU, title or folder name, whichever is known first.
    pub content_key: String,
    /// `PPSA#####` when one could be derived.
    pub identity: Option<String>,
    pub root: Location,
    pub descriptor_path: Option<String>,
    pub folder_name: String,
    pub display_title: Option<String>,
    pub content_id: Option<String>,
    pub content_version: Option<String>,
    pub sdk_version: Option<String>,
    pub region: Option<String>,
    pub sku_hint: Option<String>,
    pub icon_path: Option<PathBuf>,
    pub total_size: ContentSize,
    #[serde(skip)]
    pub descriptor: Option<Arc<Descriptor>>,
}

impl ContentUnit {
    pub fn new(
        root: Location,
        descriptor_path: Option<String>,
        descriptor: Option<Descriptor>,
        identity: Option<String>,
    ) -> Self {
        let folder_name = root.basename().unwrap_or_default();
        let display_title = descriptor.as_ref().and_then(Descriptor::display_title);
        let content_id = descriptor.as_ref().and_then(|d| d.content_id.clone());
        let sku_hint = descriptor.as_ref().and_then(|d| d.sku_hint.clone());
        let content_key = identity
            .clone()
            .or_else(|| sku_hint.clone())
            .or_else(|| display_title.clone())
            .unwrap_or_else(|| folder_name.clone());
        Self {
            content_key,
            identity,
            descriptor_path,
            display_title,
            content_id,
            content_version: descriptor.as_ref().and_then(|d| d.content_version.clone()),
            sdk_version: descriptor.as_ref().and_then(|d| d.sdk_version.clone()),
            region: descriptor.as_ref().and_then(|d| d.default_language.clone()),
            sku_hint,
            icon_path: None,
            total_size: ContentSize::Unknown,
            folder_name,
            root,
            descriptor: descriptor.map(Arc::new),
        }
    }

    pub fn with_icon(mut self, icon: Option<PathBuf>) -> Self {
        self.icon_path = icon;
        self
    }

    pub fn with_size(mut self, size: ContentSize) -> Self {
        self.total_size = size;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.root.protocol()
    }

    /// Case-insensitive comparison key.
    pub fn dedup_key(&self) -> String {
        self.content_key.to_lowercase()
    }

    pub fn naming(&self) -> NamingInput<'_> {
        NamingInput {
            display_title: self.display_title.as_deref(),
            folder_name: Some(self.folder_name.as_str()),
            identity: self.identity.as_deref(),
            source_basename: Some(self.folder_name.as_str()),
            content_version: self.content_version.as_deref(),
        }
    }
}

/// Collapses near-duplicate records: within each key group, entries whose
/// root lies strictly inside another entry's root are dropped, then only the
/// first entry per root survives. Input order is preserved.
pub fn dedupe(units: Vec<ContentUnit>) -> Vec<ContentUnit> {
    let keyed: Vec<(String, (String, PathBuf))> = units
        .iter()
        .map(|u| (u.dedup_key(), u.root.comparable()))
        .collect();

    let nested: Vec<bool> = keyed
        .iter()
        .enumerate()
        .map(|(i, (key, (scope, path)))| {
            keyed.iter().enumerate().any(|(j, (other_key, (other_scope, other_path)))| {
                i != j
                    && key == other_key
                    && scope == other_scope
                    && path != other_path
                    && path.starts_with(other_path)
            })
        })
        .collect();

    let mut seen: HashSet<(String, String, PathBuf)> = HashSet::new();
    units
        .into_iter()
        .zip(keyed)
        .zip(nested)
        .filter_map(|((unit, (key, (scope, path))), is_nested)| {
            if is_nested || !seen.insert((key, scope, path)) {
                None
            } else {
                Some(unit)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(key: &str, root: &str) -> ContentUnit {
        ContentUnit::new(Location::local(root), None, None, Some(key.to_string()))
    }

    fn roots(units: &[ContentUnit]) -> Vec<String> {
        units
            .iter()
            .map(|u| u.root.local_path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_content_key_precedence() {
        let desc = Descriptor::parse(r#"{"titleName":"Game A","contentId":"UP0001-X"}"#).unwrap();
        let u = ContentUnit::new(Location::local("/g/GameA"), None, Some(desc.clone()), None);
        // a content id without an identity is not a key
        assert_eq!(u.content_key, "Game A");
        assert_eq!(u.content_id.as_deref(), Some("UP0001-X"));

        let with_sku = Descriptor::parse(r#"{"titleName":"Game A","contentId":"UP0001-X","skuId":"ppsa-01234 eu"}"#).unwrap();
        let u = ContentUnit::new(Location::local("/g/GameA"), None, Some(with_sku), None);
        assert_eq!(u.content_key, "PPSA01234EU");

        let u = ContentUnit::new(
            Location::local("/g/GameA"),
            None,
            Some(desc),
            Some("PPSA00001".into()),
        );
        assert_eq!(u.content_key, "PPSA00001");
        assert_eq!(u.dedup_key(), "ppsa00001");

        let bare = ContentUnit::new(Location::local("/g/Folder"), None, None, None);
        assert_eq!(bare.content_key, "Folder");
    }

    #[test]
    fn test_dedupe_drops_nested() {
        let out = dedupe(vec![unit("PPSA1", "/a/b/c"), unit("ppsa1", "/a/b")]);
        assert_eq!(roots(&out), vec!["/a/b"]);
    }

    #[test]
    fn test_dedupe_keeps_first_per_path() {
        let out = dedupe(vec![
            unit("PPSA1", "/a/b"),
            unit("PPSA1", "/a/b/"),
            unit("PPSA1", "/x/b"),
        ]);
        assert_eq!(roots(&out), vec!["/a/b", "/x/b"]);
    }

    #[test]
    fn test_dedupe_groups_by_key() {
        let out = dedupe(vec![unit("PPSA1", "/a/b"), unit("PPSA2", "/a/b/c")]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let input = vec![
            unit("PPSA1", "/a/b/c"),
            unit("PPSA1", "/a/b"),
            unit("PPSA2", "/q"),
            unit("PPSA2", "/q"),
            unit("PPSA3", "/r/s"),
        ];
        let once = dedupe(input);
        let twice = dedupe(once.clone());
        assert_eq!(roots(&once), roots(&twice));
        assert_eq!(roots(&once), vec!["/a/b", "/q", "/r/s"]);
    }

    #[test]
    fn test_remote_units_never_nest_across_servers() {
        let a = FtpEndpoint::parse("10.0.0.2", 2121);
        let b = FtpEndpoint::parse("10.0.0.3", 2121);
        let out = dedupe(vec![
            ContentUnit::new(Location::ftp(a, "/data/games"), None, None, Some("K".into())),
            ContentUnit::new(Location::ftp(b, "/data/games/X"), None, None, Some("K".into())),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_size_wire_shape() {
        let json = serde_json::to_value(ContentSize::AtLeast(5)).unwrap();
        assert_eq!(json["kind"], "atLeast");
        assert_eq!(json["bytes"], 5);
        assert_eq!(ContentSize::Unknown.bytes(), None);
    }
}
