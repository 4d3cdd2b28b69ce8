//! Local copy and move engine.
//!
//! Every file is streamed through a digest into a temporary sibling tree,
//! then both sides are re-hashed and compared before the tree is promoted.
//! Moves on one device are plain renames.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::cancel::CancelToken;
use crate::config::{DigestKind, EngineConfig};
use crate::errors::{VaultError, VaultResult};
use crate::path_policy::{unique_name, NameKind};
use crate::progress::{ProgressSink, TreeProgress};
use crate::walker::{list_tree, require_complete, TreeCopy, TreeListing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDigest {
    Sha256([u8; 32]),
    Xxh3(u64),
}

impl FileDigest {
    pub fn to_hex(&self) -> String {
        match self {
            FileDigest::Sha256(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            FileDigest::Xxh3(value) => format!("{value:016x}"),
        }
    }
}

enum DigestState {
    Sha256(Sha256),
    Xxh3(Box<Xxh3>),
}

impl DigestState {
    fn new(kind: DigestKind) -> Self {
        match kind {
            DigestKind::Sha256 => DigestState::Sha256(Sha256::new()),
            DigestKind::Xxh3 => DigestState::Xxh3(Box::new(Xxh3::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            DigestState::Sha256(h) => h.update(data),
            DigestState::Xxh3(h) => h.update(data),
        }
    }

    fn finish(self) -> FileDigest {
        match self {
            DigestState::Sha256(h) => FileDigest::Sha256(h.finalize().into()),
            DigestState::Xxh3(h) => FileDigest::Xxh3(h.digest()),
        }
    }
}

pub fn hash_file(path: &Path, kind: DigestKind, buffer_size: usize) -> VaultResult<FileDigest> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(buffer_size, file);
    let mut buffer = vec![0u8; buffer_size];
    let mut state = DigestState::new(kind);
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        state.update(&buffer[..n]);
    }
    Ok(state.finish())
}

/// Decides whether a finished file copy matches its source.
pub trait CopyVerifier: Send + Sync {
    fn matches(&self, src: &Path, dst: &Path, kind: DigestKind, buffer_size: usize) -> VaultResult<bool>;
}

impl<F> CopyVerifier for F
where
    F: Fn(&Path, &Path, DigestKind, usize) -> VaultResult<bool> + Send + Sync,
{
    fn matches(&self, src: &Path, dst: &Path, kind: DigestKind, buffer_size: usize) -> VaultResult<bool> {
        self(src, dst, kind, buffer_size)
    }
}

/// Re-reads both files and compares their digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

impl CopyVerifier for DigestVerifier {
    fn matches(&self, src: &Path, dst: &Path, kind: DigestKind, buffer_size: usize) -> VaultResult<bool> {
        Ok(hash_file(src, kind, buffer_size)? == hash_file(dst, kind, buffer_size)?)
    }
}

/// Reports the storage device a path lives on.
pub trait DeviceIds: Send + Sync {
    /// `None` when the platform cannot tell.
    fn device_id(&self, path: &Path) -> Option<u64>;
}

impl<F> DeviceIds for F
where
    F: Fn(&Path) -> Option<u64> + Send + Sync,
{
    fn device_id(&self, path: &Path) -> Option<u64> {
        self(path)
    }
}

/// Device ids from file status.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsDeviceIds;

impl DeviceIds for OsDeviceIds {
    #[cfg(unix)]
    fn device_id(&self, path: &Path) -> Option<u64> {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path).ok().map(|m| m.dev())
    }

    #[cfg(not(unix))]
    fn device_id(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// Counters for the work the engine actually did.
#[derive(Debug, Default)]
pub struct EngineStats {
    files_streamed: AtomicU64,
    bytes_streamed: AtomicU64,
    renames: AtomicU64,
    verify_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub files_streamed: u64,
    pub bytes_streamed: u64,
    pub renames: u64,
    pub verify_failures: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_streamed: self.files_streamed.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            verify_failures: self.verify_failures.load(Ordering::Relaxed),
        }
    }
}

/// Removes a temporary tree on drop unless it was promoted.
struct TempTree {
    path: PathBuf,
    armed: bool,
}

impl TempTree {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempTree {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed temporary tree {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temporary tree {:?}: {}", self.path, e),
        }
    }
}

/// `<dest>.tmp-<pid>-<random>` next to `dest`.
pub fn temp_sibling(dest: &Path) -> VaultResult<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| VaultError::InvalidPath(format!("{} has no file name", dest.display())))?;
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    let temp = format!(
        "{}.tmp-{}-{}",
        name.to_string_lossy(),
        std::process::id(),
        suffix
    );
    Ok(dest.with_file_name(temp))
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_err: &io::Error) -> bool {
    false
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Could not remove {:?}: {}", path, e);
        }
    }
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

#[derive(Clone)]
pub struct LocalEngine {
    config: Arc<EngineConfig>,
    devices: Arc<dyn DeviceIds>,
    verifier: Arc<dyn CopyVerifier>,
    stats: Arc<EngineStats>,
}

impl LocalEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self::with_devices(config, Arc::new(OsDeviceIds))
    }

    pub fn with_devices(config: Arc<EngineConfig>, devices: Arc<dyn DeviceIds>) -> Self {
        Self {
            config,
            devices,
            verifier: Arc::new(DigestVerifier),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CopyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Same device for `src` and the nearest existing ancestor of `dest_parent`.
    /// Unknown counts as different.
    pub fn same_device(&self, src: &Path, dest_parent: &Path) -> bool {
        let Some(src_dev) = self.devices.device_id(src) else {
            return false;
        };
        let mut candidate = Some(dest_parent);
        while let Some(path) = candidate {
            if path.exists() {
                return self.devices.device_id(path) == Some(src_dev);
            }
            candidate = path.parent();
        }
        false
    }

    /// One streaming pass: copies `src` to `dst` while hashing, checking
    /// cancellation on every chunk.
    fn stream_copy(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancelToken,
        on_chunk: &mut dyn FnMut(u64),
    ) -> VaultResult<u64> {
        let buffer_size = self.config.copy_buffer_size;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut reader = BufReader::with_capacity(buffer_size, File::open(src)?);
        let mut out = File::create(dst)?;
        let mut writer = BufWriter::with_capacity(buffer_size, &mut out);
        let mut buffer = vec![0u8; buffer_size];
        let mut state = DigestState::new(self.config.digest);
        let mut copied = 0u64;

        self.stats.files_streamed.fetch_add(1, Ordering::Relaxed);
        loop {
            cancel.check()?;
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            state.update(&buffer[..n]);
            copied += n as u64;
            self.stats.bytes_streamed.fetch_add(n as u64, Ordering::Relaxed);
            on_chunk(copied);
        }
        writer.flush()?;
        drop(writer);
        out.sync_all()?;
        debug!("Streamed {:?} ({} bytes, {})", src, copied, state.finish().to_hex());
        Ok(copied)
    }

    /// Copies one file and verifies it by re-hashing both sides, retrying up
    /// to `verify_attempts` times. Cancellation is never retried.
    pub fn copy_and_verify_blocking(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancelToken,
        on_chunk: &mut dyn FnMut(u64),
    ) -> VaultResult<u64> {
        let attempts = self.config.verify_attempts.max(1);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut last_err = None;
        // retries restart the stream; keep reported bytes from going backwards
        let mut reported = 0u64;
        let mut report = |copied: u64| {
            if copied > reported {
                reported = copied;
                on_chunk(copied);
            }
        };

        for attempt in 1..=attempts {
            if attempt > 1 {
                std::thread::sleep(delay);
            }
            let copied = match self.stream_copy(src, dst, cancel, &mut report) {
                Ok(copied) => copied,
                Err(VaultError::Cancelled) => {
                    remove_if_present(dst);
                    return Err(VaultError::Cancelled);
                }
                Err(e) => {
                    warn!("Copy attempt {}/{} of {:?} failed: {}", attempt, attempts, src, e);
                    remove_if_present(dst);
                    last_err = Some(e);
                    continue;
                }
            };
            let verified = self
                .verifier
                .matches(src, dst, self.config.digest, self.config.copy_buffer_size);
            match verified {
                Ok(true) => {
                    if self.config.preserve_mtime {
                        self.copy_mtime(src, dst);
                    }
                    return Ok(copied);
                }
                Ok(false) => {
                    self.stats.verify_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Digest mismatch for {:?} on attempt {}/{}", src, attempt, attempts);
                    last_err = Some(VaultError::HashMismatch {
                        path: src.display().to_string(),
                        attempts,
                    });
                }
                Err(e) => last_err = Some(e),
            }
            remove_if_present(dst);
        }
        Err(last_err.unwrap_or(VaultError::HashMismatch {
            path: src.display().to_string(),
            attempts,
        }))
    }

    fn copy_mtime(&self, src: &Path, dst: &Path) {
        let result = fs::metadata(src)
            .and_then(|m| m.modified())
            .and_then(|t| filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(t)));
        if let Err(e) = result {
            debug!("Could not preserve mtime on {:?}: {}", dst, e);
        }
    }

    pub async fn copy_and_verify<F>(&self, src: &Path, dst: &Path, cancel: &CancelToken, mut on_chunk: F) -> VaultResult<u64>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let engine = self.clone();
        let (src, dst, cancel) = (src.to_path_buf(), dst.to_path_buf(), cancel.clone());
        tokio::task::spawn_blocking(move || {
            engine.copy_and_verify_blocking(&src, &dst, &cancel, &mut on_chunk)
        })
        .await?
    }

    /// Copies the tree under `src` to `dest` through a temporary sibling.
    ///
    /// A fresh `dest` receives the finished tree by rename. An existing one
    /// gets its files moved in, resolving clashes with `conflict`. On any
    /// failure the temporary tree is removed. Unreadable source directories
    /// are left out and reported in the result.
    pub async fn copy_tree(
        &self,
        src: &Path,
        dest: &Path,
        conflict: crate::path_policy::ConflictPolicy,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TreeCopy> {
        self.copy_tree_with(src, dest, conflict, false, sink, cancel).await
    }

    /// With `strict`, a source that cannot be listed completely is refused
    /// before anything is written.
    async fn copy_tree_with(
        &self,
        src: &Path,
        dest: &Path,
        conflict: crate::path_policy::ConflictPolicy,
        strict: bool,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TreeCopy> {
        let listing = list_tree(src, cancel).await?;
        let unread = listing.unread_names();
        if strict {
            require_complete(&src.display().to_string(), &unread)?;
        }
        info!(
            "Copying {} files ({} bytes) from {:?} to {:?}",
            listing.files.len(),
            listing.total_bytes,
            src,
            dest
        );
        let temp_path = temp_sibling(dest)?;
        tokio::fs::create_dir_all(&temp_path).await?;
        let mut temp = TempTree::new(temp_path.clone());
        for dir in &listing.dirs {
            tokio::fs::create_dir_all(temp_path.join(dir)).await?;
        }

        let mut progress = TreeProgress::start(sink, listing.files.len(), listing.total_bytes);
        for file in &listing.files {
            cancel.check()?;
            let rel = rel_string(&file.rel_path);
            let reporter = progress.file_reporter(rel.clone());
            self.copy_and_verify(
                &src.join(&file.rel_path),
                &temp_path.join(&file.rel_path),
                cancel,
                reporter,
            )
            .await?;
            progress.file_done(rel, file.size);
        }

        cancel.check()?;
        let dest_exists = tokio::fs::symlink_metadata(dest).await.is_ok();
        if !dest_exists {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::rename(&temp_path, dest).await {
                Ok(()) => {
                    temp.disarm();
                    return Ok(TreeCopy {
                        bytes: progress.finish(),
                        unread,
                    });
                }
                Err(e) => warn!("Promoting {:?} failed ({}), merging instead", temp_path, e),
            }
        }

        let engine = self.clone();
        let (temp_root, dest_root, cancel_token) = (temp_path.clone(), dest.to_path_buf(), cancel.clone());
        tokio::task::spawn_blocking(move || {
            engine.promote_merge(&temp_root, &dest_root, &listing, conflict, &cancel_token)
        })
        .await??;
        Ok(TreeCopy {
            bytes: progress.finish(),
            unread,
        })
    }

    /// Moves every file of a finished temporary tree into `dest`.
    fn promote_merge(
        &self,
        temp: &Path,
        dest: &Path,
        listing: &TreeListing,
        conflict: crate::path_policy::ConflictPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<()> {
        use crate::path_policy::ConflictPolicy;

        fs::create_dir_all(dest)?;
        for dir in &listing.dirs {
            fs::create_dir_all(dest.join(dir))?;
        }
        for file in &listing.files {
            let from = temp.join(&file.rel_path);
            let mut to = dest.join(&file.rel_path);
            if fs::symlink_metadata(&to).is_ok() {
                match conflict {
                    ConflictPolicy::Skip => {
                        debug!("Keeping existing {:?}", to);
                        continue;
                    }
                    ConflictPolicy::Overwrite => {
                        if to.is_dir() {
                            fs::remove_dir_all(&to)?;
                        } else {
                            fs::remove_file(&to)?;
                        }
                    }
                    ConflictPolicy::RenameUnique => {
                        to = self.unique_sibling(&to, NameKind::File)?;
                    }
                }
            }
            self.relocate_file(&from, &to, cancel)?;
        }
        Ok(())
    }

    fn unique_sibling(&self, path: &Path, kind: NameKind) -> VaultResult<PathBuf> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| VaultError::InvalidPath(path.display().to_string()))?;
        let chosen = unique_name(&name, kind, self.config.unique_name_attempts, |candidate| {
            fs::symlink_metadata(parent.join(candidate)).is_ok()
        })?;
        Ok(parent.join(chosen))
    }

    /// Rename, or verified copy plus delete when a rename is impossible.
    fn relocate_file(&self, from: &Path, to: &Path, cancel: &CancelToken) -> VaultResult<()> {
        match fs::rename(from, to) {
            Ok(()) => {
                self.stats.renames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if !is_cross_device(&e) {
                    warn!("Rename {:?} -> {:?} failed ({}), copying", from, to, e);
                }
                self.copy_and_verify_blocking(from, to, cancel, &mut |_| {})?;
                fs::remove_file(from)?;
                Ok(())
            }
        }
    }

    /// Moves the tree under `src` to `dest`.
    ///
    /// On one device a fresh target is a single rename; merging into an
    /// existing target renames the source's children one by one. Anything
    /// else, or any failure on those paths, copies and then deletes the source.
    /// That copy refuses a source with unreadable directories, so nothing is
    /// deleted that was not copied.
    pub async fn move_tree(
        &self,
        src: &Path,
        dest: &Path,
        conflict: crate::path_policy::ConflictPolicy,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<u64> {
        let listing = list_tree(src, cancel).await?;
        let parent = dest
            .parent()
            .ok_or_else(|| VaultError::InvalidPath(format!("{} has no parent", dest.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        cancel.check()?;

        if self.same_device(src, parent) {
            let dest_exists = tokio::fs::symlink_metadata(dest).await.is_ok();
            if !dest_exists {
                match tokio::fs::rename(src, dest).await {
                    Ok(()) => {
                        self.stats.renames.fetch_add(1, Ordering::Relaxed);
                        info!("Moved {:?} to {:?} by rename", src, dest);
                        return Ok(Self::report_renamed(sink, &listing));
                    }
                    Err(e) => warn!("Rename {:?} -> {:?} failed ({}), trying other strategies", src, dest, e),
                }
            } else {
                let engine = self.clone();
                let (from, to, token) = (src.to_path_buf(), dest.to_path_buf(), cancel.clone());
                let merged = tokio::task::spawn_blocking(move || {
                    engine.merge_by_rename(&from, &to, conflict, &token)
                })
                .await?;
                match merged {
                    Ok(()) => {
                        if let Err(e) = tokio::fs::remove_dir(src).await {
                            debug!("Source {:?} kept after merge: {}", src, e);
                        }
                        info!("Merged {:?} into {:?} by rename", src, dest);
                        return Ok(Self::report_renamed(sink, &listing));
                    }
                    Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
                    Err(e) => warn!("Merge by rename into {:?} failed ({}), copying", dest, e),
                }
            }
        } else {
            debug!("{:?} and {:?} are on different devices", src, parent);
        }

        let copied = self
            .copy_tree_with(src, dest, conflict, true, sink, cancel)
            .await?;
        remove_tree(src).await?;
        Ok(copied.bytes)
    }

    /// Synthetic per-file completion for a tree that moved without streaming.
    fn report_renamed(sink: Arc<dyn ProgressSink>, listing: &TreeListing) -> u64 {
        let mut progress = TreeProgress::start(sink, listing.files.len(), listing.total_bytes);
        for file in &listing.files {
            progress.file_done(rel_string(&file.rel_path), file.size);
        }
        progress.finish()
    }

    /// Renames each child of `src` into `dest`, descending into directories
    /// that exist on both sides.
    fn merge_by_rename(
        &self,
        src: &Path,
        dest: &Path,
        conflict: crate::path_policy::ConflictPolicy,
        cancel: &CancelToken,
    ) -> VaultResult<()> {
        use crate::path_policy::ConflictPolicy;

        fs::create_dir_all(dest)?;
        let mut children: Vec<fs::DirEntry> = fs::read_dir(src)?.collect::<io::Result<_>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            cancel.check()?;
            let from = child.path();
            let to = dest.join(child.file_name());
            let is_dir = child.file_type()?.is_dir();
            let existing = fs::symlink_metadata(&to).ok();

            match existing {
                None => {
                    fs::rename(&from, &to)?;
                    self.stats.renames.fetch_add(1, Ordering::Relaxed);
                }
                Some(meta) if is_dir && meta.is_dir() => {
                    self.merge_by_rename(&from, &to, conflict, cancel)?;
                    if let Err(e) = fs::remove_dir(&from) {
                        debug!("Keeping {:?}: {}", from, e);
                    }
                }
                Some(meta) => match conflict {
                    ConflictPolicy::Skip => debug!("Skipping {:?}, target exists", from),
                    ConflictPolicy::Overwrite => {
                        if meta.is_dir() {
                            fs::remove_dir_all(&to)?;
                        } else {
                            fs::remove_file(&to)?;
                        }
                        if is_dir {
                            fs::rename(&from, &to)?;
                            self.stats.renames.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.relocate_file(&from, &to, cancel)?;
                        }
                    }
                    ConflictPolicy::RenameUnique => {
                        let kind = if is_dir { NameKind::Dir } else { NameKind::File };
                        let target = self.unique_sibling(&to, kind)?;
                        fs::rename(&from, &target)?;
                        self.stats.renames.fetch_add(1, Ordering::Relaxed);
                    }
                },
            }
        }
        Ok(())
    }
}

/// Recursive delete; a missing tree is fine.
pub async fn remove_tree(path: &Path) -> VaultResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
