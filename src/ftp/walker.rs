//! Remote tree walks over a [`SharedFtp`] connection, one listing at a time.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use super::{join_remote, normalize_remote, RemoteEntry, SharedFtp};
use crate::cancel::CancelToken;
use crate::content::ContentSize;
use crate::errors::{VaultError, VaultResult};

/// Lists one directory, time-boxed.
pub async fn list_dir(ftp: &SharedFtp, path: &str, limit: Duration) -> VaultResult<Vec<RemoteEntry>> {
    let target = normalize_remote(path);
    let what = format!("listing {target}");
    let mut entries = ftp
        .run_timeout(limit, &what, move |client| client.list(&target))
        .await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// `/`-separated, relative to the listed root.
    pub rel_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteListing {
    pub files: Vec<RemoteFile>,
    /// Relative directories, parents first.
    pub dirs: Vec<String>,
    pub total_bytes: u64,
    /// Relative directories whose listing failed or timed out.
    pub unread: Vec<String>,
}

impl RemoteListing {
    pub fn is_complete(&self) -> bool {
        self.unread.is_empty()
    }
}

fn rel_join(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else {
        format!("{rel}/{name}")
    }
}

/// Full listing of a remote tree. The root must be listable; failing
/// subdirectories are logged, left out and recorded in
/// [`RemoteListing::unread`].
pub async fn list_tree(
    ftp: &SharedFtp,
    root: &str,
    cancel: &CancelToken,
    limit: Duration,
) -> VaultResult<RemoteListing> {
    let root = normalize_remote(root);
    let mut listing = RemoteListing::default();
    let mut queue = VecDeque::from([String::new()]);

    while let Some(rel) = queue.pop_front() {
        cancel.check()?;
        let dir = join_remote(&root, &rel);
        let entries = match list_dir(ftp, &dir, limit).await {
            Ok(entries) => entries,
            Err(e) if rel.is_empty() => {
                return Err(VaultError::SourceNotFound(format!("{}{}: {}", ftp.endpoint().base_url(), root, e)))
            }
            Err(e) => {
                warn!("Skipping unreadable remote directory {}: {}", dir, e);
                listing.unread.push(rel);
                continue;
            }
        };
        for entry in entries {
            let child = rel_join(&rel, &entry.name);
            if entry.is_dir() {
                listing.dirs.push(child.clone());
                queue.push_back(child);
            } else if entry.is_file() {
                listing.total_bytes += entry.size;
                listing.files.push(RemoteFile {
                    rel_path: child,
                    size: entry.size,
                });
            } else {
                debug!("Not following remote link {}", child);
            }
        }
    }
    Ok(listing)
}

#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    pub max_depth: usize,
    pub file_cap: usize,
    pub list_timeout: Duration,
}

/// Remote size results keyed by server and path.
#[derive(Debug, Default)]
pub struct SizeCache {
    entries: Mutex<HashMap<String, ContentSize>>,
}

impl SizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ftp: &SharedFtp, path: &str) -> String {
        format!("{}{}", ftp.endpoint().base_url(), normalize_remote(path))
    }

    pub fn get(&self, ftp: &SharedFtp, path: &str) -> Option<ContentSize> {
        self.entries.lock().get(&Self::key(ftp, path)).copied()
    }

    pub fn insert(&self, ftp: &SharedFtp, path: &str, size: ContentSize) {
        self.entries.lock().insert(Self::key(ftp, path), size);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Bounded recursive size of a remote tree. Hitting the depth or file cap,
/// or a listing timeout, makes the answer [`ContentSize::AtLeast`].
pub async fn remote_tree_size(
    ftp: &SharedFtp,
    root: &str,
    limits: SizeLimits,
    cache: &SizeCache,
    cancel: &CancelToken,
) -> VaultResult<ContentSize> {
    if let Some(size) = cache.get(ftp, root) {
        return Ok(size);
    }
    let root = normalize_remote(root);
    let mut total = 0u64;
    let mut files = 0usize;
    let mut partial = false;
    let mut queue = VecDeque::from([(root.clone(), 0usize)]);

    'walk: while let Some((dir, depth)) = queue.pop_front() {
        cancel.check()?;
        let entries = match list_dir(ftp, &dir, limits.list_timeout).await {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e),
            Err(e) => {
                warn!("Size of {} is partial: {}", dir, e);
                partial = true;
                continue;
            }
        };
        for entry in entries {
            if entry.is_file() {
                total += entry.size;
                files += 1;
                if files >= limits.file_cap {
                    partial = true;
                    break 'walk;
                }
            } else if entry.is_dir() {
                if depth + 1 > limits.max_depth {
                    partial = true;
                } else {
                    queue.push_back((join_remote(&dir, &entry.name), depth + 1));
                }
            }
        }
    }

    let size = if partial {
        ContentSize::AtLeast(total)
    } else {
        ContentSize::Exact(total)
    };
    cache.insert(ftp, &root, size);
    Ok(size)
}
