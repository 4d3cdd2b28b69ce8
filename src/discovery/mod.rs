//! Content discovery: finds content roots below a source and describes them.
//!
//! Local sources get two passes over one walk. The first follows every
//! descriptor file up to its content root. The second picks up
//! identity-named folders whose descriptor sits somewhere unusual. Results go
//! through [`dedupe`] before they are returned.

pub mod ftp;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::content::{dedupe, ContentUnit, Location};
use crate::descriptor::{
    canonical_content_root, extract_identity_key, find_descriptor_in, find_icon, is_identity_dir_name,
    is_metadata_dir_name, read_descriptor, DESCRIPTOR_FILE,
};
use crate::errors::VaultResult;
use crate::path_policy::normalize_lexically;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::walker::{tree_size, Descend, TreeWalker};

/// How far above a descriptor a metadata directory is looked for.
const METADATA_SEARCH_LEVELS: usize = 3;
/// How far above a content root an identity-named folder is looked for.
const CANONICAL_LEVELS: usize = 8;
/// Depth of the descriptor search inside an identity folder.
const IDENTITY_DESCRIPTOR_DEPTH: usize = 3;

/// Sends [`ProgressEvent::DiscoveryProgress`] every `every` items and on the last one.
pub(crate) struct DiscoveryTicker {
    sink: Arc<dyn ProgressSink>,
    every: usize,
    index: usize,
    total: usize,
}

impl DiscoveryTicker {
    pub(crate) fn new(sink: Arc<dyn ProgressSink>, every: usize, total: usize) -> Self {
        Self {
            sink,
            every: every.max(1),
            index: 0,
            total,
        }
    }

    pub(crate) fn tick(&mut self, current: &str) {
        self.index += 1;
        if self.index % self.every == 0 || self.index == self.total {
            self.sink.emit(ProgressEvent::DiscoveryProgress {
                index: self.index,
                total: self.total,
                current_path: current.to_string(),
            });
        }
    }
}

/// Root of the unit a descriptor belongs to, or `None` when no metadata
/// directory sits between it and a few levels up.
fn content_root_for(descriptor_path: &Path) -> Option<PathBuf> {
    let descriptor_dir = descriptor_path.parent()?;
    let mut current = descriptor_dir;
    let mut meta_parent = None;
    for _ in 0..=METADATA_SEARCH_LEVELS {
        let name = current.file_name()?.to_string_lossy();
        if is_metadata_dir_name(&name) {
            meta_parent = current.parent();
            break;
        }
        current = current.parent()?;
    }
    let root = meta_parent?;
    Some(canonical_content_root(descriptor_dir, CANONICAL_LEVELS).unwrap_or_else(|| root.to_path_buf()))
}

/// Walk results: descriptor files and outermost identity folders.
#[derive(Debug, Default)]
struct Candidates {
    descriptors: Vec<PathBuf>,
    identity_dirs: Vec<PathBuf>,
}

pub struct LocalDiscovery {
    config: Arc<EngineConfig>,
    walker: TreeWalker,
}

impl LocalDiscovery {
    pub fn new(config: Arc<EngineConfig>) -> VaultResult<Self> {
        let walker = TreeWalker::from_config(&config)?;
        Ok(Self { config, walker })
    }

    async fn collect(&self, root: &Path, cancel: &CancelToken) -> VaultResult<Candidates> {
        let mut candidates = Candidates::default();
        let summary = self
            .walker
            .walk(root, cancel, |entry| {
                if entry.is_file {
                    if entry.name.eq_ignore_ascii_case(DESCRIPTOR_FILE) {
                        candidates.descriptors.push(entry.path.clone());
                    }
                } else if is_identity_dir_name(&entry.name) {
                    candidates.identity_dirs.push(entry.path.clone());
                }
                Descend::Yes
            })
            .await?;
        debug!(
            "Walked {:?}: {} dirs read, {} unreadable",
            root, summary.dirs_read, summary.dirs_failed
        );

        // only the outermost identity folder of a nest counts
        let all: HashSet<PathBuf> = candidates.identity_dirs.iter().cloned().collect();
        candidates
            .identity_dirs
            .retain(|dir| !dir.ancestors().skip(1).any(|a| all.contains(a)));
        candidates.descriptors.sort();
        candidates.identity_dirs.sort();
        Ok(candidates)
    }

    /// Every content unit below `root`, deduplicated.
    pub async fn discover(
        &self,
        root: &Path,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<Vec<ContentUnit>> {
        info!("Scanning {:?}", root);
        let candidates = self.collect(root, cancel).await?;
        let total = candidates.descriptors.len() + candidates.identity_dirs.len();
        let mut ticker = DiscoveryTicker::new(sink, self.config.progress_every, total);
        let mut seen: HashSet<(String, PathBuf)> = HashSet::new();
        let mut units = Vec::new();

        for descriptor_path in &candidates.descriptors {
            cancel.check()?;
            ticker.tick(&descriptor_path.display().to_string());
            if let Some(unit) = self.from_descriptor(descriptor_path, &mut seen, cancel).await? {
                units.push(unit);
            }
        }

        for dir in &candidates.identity_dirs {
            cancel.check()?;
            ticker.tick(&dir.display().to_string());
            if let Some(unit) = self.from_identity_dir(dir, &mut seen, cancel).await? {
                units.push(unit);
            }
        }

        let found = units.len();
        let units = dedupe(units);
        info!(
            "Found {} content unit(s) under {:?} ({} before dedup)",
            units.len(),
            root,
            found
        );
        Ok(units)
    }

    async fn from_descriptor(
        &self,
        descriptor_path: &Path,
        seen: &mut HashSet<(String, PathBuf)>,
        cancel: &CancelToken,
    ) -> VaultResult<Option<ContentUnit>> {
        let Some(root) = content_root_for(descriptor_path) else {
            debug!("No metadata directory above {:?}", descriptor_path);
            return Ok(None);
        };
        let Some(descriptor) = read_descriptor(descriptor_path).await else {
            return Ok(None);
        };
        let identity = descriptor.identity_key();
        let key = (identity.clone().unwrap_or_default(), normalize_lexically(&root));
        if !seen.insert(key) {
            debug!("Already have {:?}", root);
            return Ok(None);
        }
        Ok(Some(
            self.build_unit(root, descriptor_path, descriptor, identity, cancel)
                .await?,
        ))
    }

    async fn from_identity_dir(
        &self,
        dir: &Path,
        seen: &mut HashSet<(String, PathBuf)>,
        cancel: &CancelToken,
    ) -> VaultResult<Option<ContentUnit>> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name_key = extract_identity_key(&name).unwrap_or_else(|| name.to_uppercase());
        let normalized = normalize_lexically(dir);
        if seen.contains(&(name_key.clone(), normalized.clone())) {
            return Ok(None);
        }
        let Some(descriptor_path) = find_descriptor_in(dir, IDENTITY_DESCRIPTOR_DEPTH).await else {
            debug!("No descriptor inside {:?}", dir);
            return Ok(None);
        };
        let Some(descriptor) = read_descriptor(&descriptor_path).await else {
            return Ok(None);
        };
        let identity = descriptor
            .content_id
            .as_deref()
            .and_then(extract_identity_key)
            .unwrap_or(name_key);
        if !seen.insert((identity.clone(), normalized)) {
            return Ok(None);
        }
        Ok(Some(
            self.build_unit(dir.to_path_buf(), &descriptor_path, descriptor, Some(identity), cancel)
                .await?,
        ))
    }

    async fn build_unit(
        &self,
        root: PathBuf,
        descriptor_path: &Path,
        descriptor: crate::descriptor::Descriptor,
        identity: Option<String>,
        cancel: &CancelToken,
    ) -> VaultResult<ContentUnit> {
        let icon = find_icon(&root).await;
        let size = match tree_size(&root, self.config.size_file_cap, cancel).await {
            Ok(size) => size,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!("Cannot size {:?}: {}", root, e);
                Default::default()
            }
        };
        debug!("Content unit at {:?} ({:?}, {})", root, identity, size);
        Ok(ContentUnit::new(
            Location::local(root),
            Some(descriptor_path.display().to_string()),
            Some(descriptor),
            identity,
        )
        .with_icon(icon)
        .with_size(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentSize;
    use crate::errors::VaultError;
    use crate::progress::{null_sink, ProgressLog};
    use std::fs;

    fn write_param(dir: &Path, body: &str) {
        fs::create_dir_all(dir.join("sce_sys")).unwrap();
        fs::write(dir.join("sce_sys/param.json"), body).unwrap();
    }

    fn discovery() -> LocalDiscovery {
        LocalDiscovery::new(Arc::new(EngineConfig {
            progress_every: 1,
            ..Default::default()
        }))
        .unwrap()
    }

    #[test]
    fn test_content_root_for() {
        assert_eq!(
            content_root_for(Path::new("/lib/GameA/sce_sys/param.json")),
            Some(PathBuf::from("/lib/GameA"))
        );
        assert_eq!(
            content_root_for(Path::new("/lib/PPSA01234/app/sce_sys/param.json")),
            Some(PathBuf::from("/lib/PPSA01234"))
        );
        assert_eq!(content_root_for(Path::new("/lib/GameA/param.json")), None);
    }

    #[tokio::test]
    async fn test_discovers_single_game() {
        let dir = tempfile::tempdir().unwrap();
        let game = dir.path().join("GameA");
        let body = r#"{"titleName":"Game A","contentId":"PPSA00001"}"#;
        write_param(&game, body);
        fs::write(game.join("data.bin"), vec![0u8; 1024]).unwrap();
        fs::write(game.join("sce_sys/icon0.png"), b"png").unwrap();
        let log = ProgressLog::new();

        let units = discovery()
            .discover(dir.path(), log.clone(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.content_key, "PPSA00001");
        assert_eq!(unit.display_title.as_deref(), Some("Game A"));
        assert_eq!(unit.root, Location::local(&game));
        assert_eq!(unit.icon_path, Some(game.join("sce_sys/icon0.png")));
        assert_eq!(unit.total_size, ContentSize::Exact(1024 + body.len() as u64 + 3));
        assert!(log
            .events()
            .iter()
            .any(|e| matches!(e, ProgressEvent::DiscoveryProgress { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_identity_folder_pass() {
        let dir = tempfile::tempdir().unwrap();
        // descriptor too deep for the metadata rule, found by the identity pass
        let ppsa = dir.path().join("dump/PPSA04321");
        fs::create_dir_all(ppsa.join("payload/meta")).unwrap();
        fs::write(
            ppsa.join("payload/meta/param.json"),
            r#"{"localizedParameters":{"en-US":{"titleName":"Deep"}}}"#,
        )
        .unwrap();

        let units = discovery()
            .discover(dir.path(), null_sink(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].identity.as_deref(), Some("PPSA04321"));
        assert_eq!(units[0].display_title.as_deref(), Some("Deep"));
        assert_eq!(units[0].root, Location::local(&ppsa));
    }

    #[tokio::test]
    async fn test_nested_duplicates_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("PPSA00077");
        write_param(&outer, r#"{"titleName":"Outer","contentId":"PPSA00077"}"#);
        write_param(
            &outer.join("PPSA00077-app"),
            r#"{"titleName":"Inner","contentId":"PPSA00077"}"#,
        );

        let units = discovery()
            .discover(dir.path(), null_sink(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].root, Location::local(&outer));
    }

    #[tokio::test]
    async fn test_bad_descriptors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_param(&dir.path().join("Broken"), "{ not json");
        write_param(&dir.path().join("Good"), r#"{"titleName":"Good"}"#);
        fs::create_dir_all(dir.path().join(".hidden/sce_sys")).unwrap();
        fs::write(dir.path().join(".hidden/sce_sys/param.json"), r#"{"titleName":"Hidden"}"#).unwrap();

        let units = discovery()
            .discover(dir.path(), null_sink(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content_key, "Good");
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = discovery()
            .discover(&dir.path().join("nope"), null_sink(), &CancelToken::new())
            .await;
        assert!(matches!(result, Err(VaultError::SourceNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_param(&dir.path().join("GameA"), r#"{"titleName":"A"}"#);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = discovery()
            .discover(dir.path(), null_sink(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
