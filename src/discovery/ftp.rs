//! Discovery over FTP.
//!
//! A bare host or a mount root is expanded into the known game directories
//! below each mount point. Every subdirectory of a games directory is a
//! candidate. A candidate holding a metadata directory is a content root;
//! otherwise its subdirectories are searched a few levels deeper.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::DiscoveryTicker;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::content::{dedupe, ContentUnit, Location};
use crate::descriptor::{
    extract_identity_key, is_metadata_dir_name, read_descriptor, Descriptor, DESCRIPTOR_FILE, ICON_CANDIDATES,
};
use crate::errors::{VaultError, VaultResult};
use crate::ftp::walker::list_dir;
use crate::ftp::{join_remote, normalize_remote, RemoteEntry, SharedFtp};
use crate::progress::ProgressSink;
use crate::walker::SkipRules;

pub struct FtpDiscovery<'a> {
    config: &'a EngineConfig,
    ftp: &'a SharedFtp,
    skip: SkipRules,
    list_timeout: Duration,
}

impl<'a> FtpDiscovery<'a> {
    pub fn new(config: &'a EngineConfig, ftp: &'a SharedFtp) -> VaultResult<Self> {
        Ok(Self {
            config,
            ftp,
            skip: config.skip_rules()?,
            list_timeout: Duration::from_secs(config.ftp.list_timeout_secs),
        })
    }

    /// Directories to look for candidates in. The given path itself unless
    /// it is `/` or a mount point, in which case the game directories below
    /// it that can be listed.
    async fn games_dirs(&self, start: &str) -> VaultResult<Vec<String>> {
        let settings = &self.config.ftp;
        let mounts: Vec<String> = if start == "/" {
            settings.mount_points.iter().map(|m| normalize_remote(m)).collect()
        } else if settings
            .mount_points
            .iter()
            .any(|m| normalize_remote(m).eq_ignore_ascii_case(start))
        {
            vec![start.to_string()]
        } else {
            return Ok(vec![start.to_string()]);
        };

        let mut found = Vec::new();
        for mount in &mounts {
            for sub in &settings.game_subdirs {
                let dir = join_remote(mount, sub);
                match list_dir(self.ftp, &dir, self.list_timeout).await {
                    Ok(_) => found.push(dir),
                    Err(e) => debug!("No games directory at {}: {}", dir, e),
                }
            }
        }
        if found.is_empty() {
            info!("No known games directory under {}, scanning it directly", start);
            found.push(start.to_string());
        }
        Ok(found)
    }

    /// Content roots at or below `candidate`, without entering a root once found.
    async fn roots_below(&self, candidate: &str, cancel: &CancelToken) -> VaultResult<Vec<(String, Vec<RemoteEntry>)>> {
        let mut roots = Vec::new();
        let mut queue = VecDeque::from([(candidate.to_string(), 0usize)]);
        while let Some((dir, depth)) = queue.pop_front() {
            cancel.check()?;
            let entries = match list_dir(self.ftp, &dir, self.list_timeout).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping unreadable remote directory {}: {}", dir, e);
                    continue;
                }
            };
            if entries.iter().any(|e| e.is_dir() && is_metadata_dir_name(&e.name)) {
                roots.push((dir, entries));
                continue;
            }
            if depth < self.config.ftp.scan_depth {
                queue.extend(
                    entries
                        .iter()
                        .filter(|e| e.is_dir() && !self.skip.is_skipped(&e.name))
                        .map(|e| (join_remote(&dir, &e.name), depth + 1)),
                );
            }
        }
        Ok(roots)
    }

    /// Every content unit reachable from the connection's path, deduplicated.
    pub async fn discover(&self, sink: Arc<dyn ProgressSink>, cancel: &CancelToken) -> VaultResult<Vec<ContentUnit>> {
        let start = normalize_remote(&self.ftp.endpoint().path);
        info!("Scanning {}{}", self.ftp.endpoint().base_url(), start);

        let mut candidates = Vec::new();
        for games_dir in self.games_dirs(&start).await? {
            let entries = match list_dir(self.ftp, &games_dir, self.list_timeout).await {
                Ok(entries) => entries,
                Err(e) if games_dir == start => {
                    return Err(match e {
                        VaultError::Timeout(_) => e,
                        other => VaultError::SourceNotFound(format!(
                            "{}{}: {}",
                            self.ftp.endpoint().base_url(),
                            start,
                            other
                        )),
                    })
                }
                Err(e) => {
                    warn!("Skipping {}: {}", games_dir, e);
                    continue;
                }
            };
            candidates.extend(
                entries
                    .into_iter()
                    .filter(|e| e.is_dir() && !self.skip.is_skipped(&e.name))
                    .map(|e| join_remote(&games_dir, &e.name)),
            );
        }

        let mut ticker = DiscoveryTicker::new(sink, self.config.progress_every, candidates.len());
        let mut units = Vec::new();
        for candidate in &candidates {
            cancel.check()?;
            ticker.tick(&format!("{}{}", self.ftp.endpoint().base_url(), candidate));
            for (root, entries) in self.roots_below(candidate, cancel).await? {
                if let Some(unit) = self.describe(&root, &entries).await? {
                    units.push(unit);
                }
            }
        }

        let units = dedupe(units);
        info!("Found {} content unit(s) over FTP", units.len());
        Ok(units)
    }

    /// Fetches and parses the descriptor of a content root, plus its cover.
    async fn describe(&self, root: &str, entries: &[RemoteEntry]) -> VaultResult<Option<ContentUnit>> {
        let Some(meta_name) = entries
            .iter()
            .find(|e| e.is_dir() && is_metadata_dir_name(&e.name))
            .map(|e| e.name.clone())
        else {
            return Ok(None);
        };
        let meta_dir = join_remote(root, &meta_name);
        let meta_entries = match list_dir(self.ftp, &meta_dir, self.list_timeout).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", meta_dir, e);
                return Ok(None);
            }
        };
        let Some(descriptor_name) = meta_entries
            .iter()
            .find(|e| e.is_file() && e.name.eq_ignore_ascii_case(DESCRIPTOR_FILE))
            .map(|e| e.name.clone())
        else {
            debug!("No descriptor in {}", meta_dir);
            return Ok(None);
        };
        let descriptor_path = join_remote(&meta_dir, &descriptor_name);
        let Some(descriptor) = self.fetch_descriptor(&descriptor_path).await? else {
            return Ok(None);
        };

        let folder = crate::ftp::remote_basename(root).unwrap_or_default().to_string();
        let identity = descriptor
            .identity_key()
            .or_else(|| extract_identity_key(&folder));
        let cache_name = identity.clone().unwrap_or_else(|| folder.clone());
        let cover = self.fetch_cover(&meta_dir, &meta_entries, &cache_name).await;

        Ok(Some(
            ContentUnit::new(
                Location::ftp(self.ftp.endpoint().clone(), root),
                Some(descriptor_path),
                Some(descriptor),
                identity,
            )
            .with_icon(cover),
        ))
    }

    /// Downloads the descriptor into a temporary file that is removed on every path.
    async fn fetch_descriptor(&self, remote: &str) -> VaultResult<Option<Descriptor>> {
        let scratch = tempfile::Builder::new()
            .prefix("ps5vault-param-")
            .suffix(".json")
            .tempfile()?;
        let local = scratch.path().to_path_buf();
        let from = remote.to_string();
        if let Err(e) = self.ftp.run(move |client| client.download(&from, &local)).await {
            warn!("Cannot fetch {}: {}", remote, e);
            return Ok(None);
        }
        Ok(read_descriptor(scratch.path()).await)
    }

    /// First known cover image, cached locally. Absence is not an error.
    async fn fetch_cover(&self, meta_dir: &str, meta_entries: &[RemoteEntry], cache_name: &str) -> Option<PathBuf> {
        let name = ICON_CANDIDATES.iter().find_map(|candidate| {
            meta_entries
                .iter()
                .find(|e| e.is_file() && e.name.eq_ignore_ascii_case(candidate))
                .map(|e| e.name.clone())
        })?;
        let endpoint = self.ftp.endpoint();
        let dir = self
            .config
            .cover_cache_root()
            .join(format!("{}_{}", sanitize(&endpoint.host), endpoint.port))
            .join(sanitize(cache_name));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("Cannot create cover cache {:?}: {}", dir, e);
            return None;
        }
        let local = dir.join(&name);
        let remote = join_remote(meta_dir, &name);
        let target = local.clone();
        match self.ftp.run(move |client| client.download(&remote, &target)).await {
            Ok(_) => Some(local),
            Err(e) => {
                debug!("No cover fetched for {}: {}", cache_name, e);
                let _ = tokio::fs::remove_file(&local).await;
                None
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Convenience wrapper used by the facade.
pub async fn discover_ftp(
    config: &EngineConfig,
    ftp: &SharedFtp,
    sink: Arc<dyn ProgressSink>,
    cancel: &CancelToken,
) -> VaultResult<Vec<ContentUnit>> {
    FtpDiscovery::new(config, ftp)?.discover(sink, cancel).await
}
