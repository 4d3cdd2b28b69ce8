//! Local directory enumeration.
//!
//! [`TreeWalker`] is the breadth-first, batch-concurrent walk used by
//! discovery. [`list_tree`] and [`tree_size`] are full listings for copy and
//! size accounting; they run on the blocking pool through walkdir.

use futures::future::join_all;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::content::ContentSize;
use crate::errors::{VaultError, VaultResult};

pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "snapshots",
    "system volume information",
    "$recycle.bin",
    "recycle.bin",
    "recycle",
    "trash",
    "tmp",
    "temp",
    "windows",
    "program files",
    "program files (x86)",
];

/// Hidden or on the default deny list.
pub fn is_default_skipped(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with('.') || DEFAULT_SKIP_DIRS.contains(&lower.as_str())
}

/// Which directory names the discovery walk never enters.
#[derive(Debug, Clone)]
pub struct SkipRules {
    names: HashSet<String>,
    globs: Option<GlobSet>,
}

impl SkipRules {
    pub fn new(names: &[String], globs: &[String]) -> VaultResult<Self> {
        let globs = if globs.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in globs {
                let glob = Glob::new(&pattern.to_lowercase())
                    .map_err(|e| VaultError::Config(format!("bad skip glob '{pattern}': {e}")))?;
                builder.add(glob);
            }
            Some(
                builder
                    .build()
                    .map_err(|e| VaultError::Config(e.to_string()))?,
            )
        };
        Ok(Self {
            names: names.iter().map(|n| n.to_lowercase()).collect(),
            globs,
        })
    }

    pub fn is_skipped(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.starts_with('.')
            || self.names.contains(&lower)
            || self.globs.as_ref().is_some_and(|g| g.is_match(&lower))
    }
}

impl Default for SkipRules {
    fn default() -> Self {
        Self {
            names: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
            globs: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Relative to the walk root.
    pub rel_path: PathBuf,
    pub name: String,
    pub is_file: bool,
    /// Zero for directories.
    pub size: u64,
    /// 1 for direct children of the root.
    pub depth: usize,
}

/// Visitor verdict for a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub dirs_read: usize,
    pub dirs_failed: usize,
}

pub struct TreeWalker {
    max_depth: usize,
    concurrency: usize,
    skip: SkipRules,
}

struct RawEntry {
    path: PathBuf,
    name: String,
    is_dir: bool,
    size: u64,
}

async fn read_entries(dir: &Path) -> io::Result<Vec<RawEntry>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut out = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let file_type = match entry.file_type().await {
            Ok(t) => t,
            Err(e) => {
                debug!("Cannot stat {:?}: {}", entry.path(), e);
                continue;
            }
        };
        if file_type.is_symlink() {
            continue;
        }
        let size = if file_type.is_file() {
            match entry.metadata().await {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!("Cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            }
        } else {
            0
        };
        out.push(RawEntry {
            path: entry.path(),
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
            size,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

impl TreeWalker {
    pub fn new(max_depth: usize, concurrency: usize, skip: SkipRules) -> Self {
        Self {
            max_depth,
            concurrency: concurrency.max(1),
            skip,
        }
    }

    pub fn from_config(config: &EngineConfig) -> VaultResult<Self> {
        Ok(Self::new(
            config.max_scan_depth,
            config.scan_concurrency,
            config.skip_rules()?,
        ))
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Walks `root` level by level, reading up to `concurrency` directories
    /// at once. `visit` sees every file and every non-skipped directory; it
    /// returns [`Descend::No`] to keep the walk out of a directory.
    ///
    /// An unreadable root is an error; an unreadable subdirectory is logged
    /// and its subtree dropped. Cancellation is checked before each batch.
    pub async fn walk<F>(&self, root: &Path, cancel: &CancelToken, mut visit: F) -> VaultResult<WalkSummary>
    where
        F: FnMut(&WalkEntry) -> Descend,
    {
        let mut summary = WalkSummary::default();
        let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::from([(root.to_path_buf(), 0)]);

        while !queue.is_empty() {
            cancel.check()?;
            let take = queue.len().min(self.concurrency);
            let batch: Vec<(PathBuf, usize)> = queue.drain(..take).collect();
            let listings = join_all(batch.iter().map(|(dir, _)| read_entries(dir))).await;

            for ((dir, depth), listing) in batch.into_iter().zip(listings) {
                let entries = match listing {
                    Ok(entries) => entries,
                    Err(e) if depth == 0 => {
                        return Err(if e.kind() == io::ErrorKind::NotFound {
                            VaultError::SourceNotFound(dir.display().to_string())
                        } else {
                            e.into()
                        });
                    }
                    Err(e) => {
                        warn!("Skipping unreadable directory {:?}: {}", dir, e);
                        summary.dirs_failed += 1;
                        continue;
                    }
                };
                summary.dirs_read += 1;

                for raw in entries {
                    if raw.is_dir && self.skip.is_skipped(&raw.name) {
                        continue;
                    }
                    let entry = WalkEntry {
                        rel_path: raw.path.strip_prefix(root).unwrap_or(&raw.path).to_path_buf(),
                        path: raw.path,
                        name: raw.name,
                        is_file: !raw.is_dir,
                        size: raw.size,
                        depth: depth + 1,
                    };
                    let verdict = visit(&entry);
                    if raw.is_dir && verdict == Descend::Yes && depth + 1 <= self.max_depth {
                        queue.push_back((entry.path, depth + 1));
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Relative to the listed root.
    pub rel_path: PathBuf,
    pub size: u64,
}

/// Every file and directory under a root, parents before children.
#[derive(Debug, Clone, Default)]
pub struct TreeListing {
    pub files: Vec<TreeFile>,
    pub dirs: Vec<PathBuf>,
    pub total_bytes: u64,
    /// Entries that could not be read, with everything below them.
    pub unread: Vec<PathBuf>,
}

impl TreeListing {
    pub fn is_complete(&self) -> bool {
        self.unread.is_empty()
    }

    pub fn unread_names(&self) -> Vec<String> {
        self.unread
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect()
    }
}

/// Bytes written by a tree transfer and the source directories it could not read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCopy {
    pub bytes: u64,
    /// Relative to the source root, `/`-separated.
    pub unread: Vec<String>,
}

impl TreeCopy {
    pub fn is_complete(&self) -> bool {
        self.unread.is_empty()
    }
}

/// `IncompleteSource` for `source` unless nothing was left unread.
pub fn require_complete(source: &str, unread: &[String]) -> VaultResult<()> {
    if unread.is_empty() {
        return Ok(());
    }
    warn!("Refusing to move {}: unreadable {:?}", source, unread);
    Err(VaultError::IncompleteSource {
        path: source.to_string(),
        unread: unread.len(),
    })
}

/// Lists a whole tree without skip rules. Unreadable subtrees are logged,
/// left out and recorded in [`TreeListing::unread`].
pub async fn list_tree(root: &Path, cancel: &CancelToken) -> VaultResult<TreeListing> {
    let root = root.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || list_tree_blocking(&root, &cancel)).await?
}

pub(crate) fn list_tree_blocking(root: &Path, cancel: &CancelToken) -> VaultResult<TreeListing> {
    if !root.is_dir() {
        return Err(VaultError::SourceNotFound(root.display().to_string()));
    }
    let mut listing = TreeListing::default();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        cancel.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                let rel = e
                    .path()
                    .map(|p| p.strip_prefix(root).unwrap_or(p).to_path_buf())
                    .unwrap_or_default();
                listing.unread.push(rel);
                continue;
            }
        };
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            listing.dirs.push(rel);
        } else if file_type.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            listing.total_bytes += size;
            listing.files.push(TreeFile {
                rel_path: rel,
                size,
            });
        } else {
            debug!("Not copying special file {:?}", entry.path());
        }
    }
    Ok(listing)
}

/// Sums file sizes, stopping at `file_cap` files with an at-least answer.
pub async fn tree_size(root: &Path, file_cap: usize, cancel: &CancelToken) -> VaultResult<ContentSize> {
    let root = root.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || -> VaultResult<ContentSize> {
        let mut total = 0u64;
        let mut files = 0usize;
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            cancel.check()?;
            if !entry.file_type().is_file() {
                continue;
            }
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            files += 1;
            if files >= file_cap {
                return Ok(ContentSize::AtLeast(total));
            }
        }
        Ok(ContentSize::Exact(total))
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("a/b/c/d")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("top.txt"), b"12345").unwrap();
        fs::write(root.join("a/b/c/d/deep.txt"), b"x").unwrap();
        fs::write(root.join(".hidden/secret"), b"s").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), b"js").unwrap();
    }

    async fn names(walker: &TreeWalker, root: &Path) -> Vec<String> {
        let mut seen = Vec::new();
        walker
            .walk(root, &CancelToken::new(), |e| {
                seen.push(e.rel_path.to_string_lossy().replace('\\', "/"));
                Descend::Yes
            })
            .await
            .unwrap();
        seen
    }

    #[test]
    fn test_skip_rules() {
        let rules = SkipRules::new(&["Trash".into()], &["backup*".into()]).unwrap();
        assert!(rules.is_skipped(".git"));
        assert!(rules.is_skipped("TRASH"));
        assert!(rules.is_skipped("Backup-2024"));
        assert!(!rules.is_skipped("games"));
        assert!(SkipRules::new(&[], &["[".into()]).is_err());
    }

    #[tokio::test]
    async fn test_walk_skips_hidden_and_denied() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let walker = TreeWalker::new(6, 4, SkipRules::default());
        let seen = names(&walker, dir.path()).await;
        assert!(seen.contains(&"top.txt".to_string()));
        assert!(seen.contains(&"a/b/c/d/deep.txt".to_string()));
        assert!(!seen.iter().any(|p| p.contains("hidden")));
        assert!(!seen.iter().any(|p| p.contains("node_modules")));
    }

    #[tokio::test]
    async fn test_walk_caps_depth() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let walker = TreeWalker::new(2, 16, SkipRules::default());
        let seen = names(&walker, dir.path()).await;
        // depth 2 directory `a/b` is read, its child `c` is seen but not entered
        assert!(seen.contains(&"a/b/c".to_string()));
        assert!(!seen.iter().any(|p| p.starts_with("a/b/c/")));
    }

    #[tokio::test]
    async fn test_walk_respects_descend_no() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let walker = TreeWalker::new(6, 16, SkipRules::default());
        let mut seen = Vec::new();
        walker
            .walk(dir.path(), &CancelToken::new(), |e| {
                seen.push(e.name.clone());
                if e.name == "a" {
                    Descend::No
                } else {
                    Descend::Yes
                }
            })
            .await
            .unwrap();
        assert!(seen.contains(&"a".to_string()));
        assert!(!seen.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_walk_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let walker = TreeWalker::new(6, 16, SkipRules::default());
        let result = walker
            .walk(&dir.path().join("nope"), &CancelToken::new(), |_| Descend::Yes)
            .await;
        assert!(matches!(result, Err(VaultError::SourceNotFound(_))));
    }

    #[tokio::test]
    async fn test_walk_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let walker = TreeWalker::new(6, 16, SkipRules::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = walker.walk(dir.path(), &cancel, |_| Descend::Yes).await;
        assert!(matches!(result, Err(VaultError::Cancelled)));
    }

    #[tokio::test]
    async fn test_list_tree_includes_everything() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        let listing = list_tree(dir.path(), &CancelToken::new()).await.unwrap();
        assert_eq!(listing.files.len(), 4);
        assert_eq!(listing.total_bytes, 5 + 1 + 1 + 2);
        assert!(listing.dirs.contains(&PathBuf::from("empty")));
        assert!(listing.dirs.contains(&PathBuf::from(".hidden")));
        let a = listing.dirs.iter().position(|d| d == Path::new("a")).unwrap();
        let ab = listing.dirs.iter().position(|d| d == Path::new("a/b")).unwrap();
        assert!(a < ab);
        assert!(listing.is_complete());
    }

    #[test]
    fn test_require_complete() {
        assert!(require_complete("/src/Game", &[]).is_ok());
        let err = require_complete("/src/Game", &["data/locked".into()]).unwrap_err();
        assert!(matches!(err, VaultError::IncompleteSource { unread: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_tree_records_unreadable_dirs() {
        use std::os::unix::fs::PermissionsExt;

        // root ignores directory permissions
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let locked = dir.path().join("a/b");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let listing = list_tree(dir.path(), &CancelToken::new()).await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let listing = listing.unwrap();
        assert!(!listing.is_complete());
        assert_eq!(listing.unread_names(), vec!["a/b".to_string()]);
        assert!(!listing.files.iter().any(|f| f.rel_path.starts_with("a/b/c")));
    }

    #[tokio::test]
    async fn test_tree_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}")), vec![0u8; 10]).unwrap();
        }
        let cancel = CancelToken::new();
        assert_eq!(tree_size(dir.path(), 100, &cancel).await.unwrap(), ContentSize::Exact(50));
        assert_eq!(tree_size(dir.path(), 3, &cancel).await.unwrap(), ContentSize::AtLeast(30));
    }
}
