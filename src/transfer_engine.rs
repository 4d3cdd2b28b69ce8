//! Runs transfer requests: one item at a time, in request order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::content::{ContentUnit, Location, Protocol};
use crate::descriptor::{read_descriptor, Descriptor, DESCRIPTOR_FILE, METADATA_DIR};
use crate::errors::{VaultError, VaultResult};
use crate::file_ops::{remove_tree, LocalEngine};
use crate::ftp::address::FtpEndpoint;
use crate::ftp::transfer::{
    delete_remote_tree, download_tree, ensure_remote_dir, remote_exists, rename_remote, upload_tree,
};
use crate::ftp::walker::list_dir;
use crate::ftp::{join_remote, normalize_remote, remote_basename, remote_parent, FtpConnector, SharedFtp};
use crate::path_policy::{
    check_overlap, check_overlap_remote, ensure_unique_target, normalize_lexically, target_segments,
    unique_name, ConflictPolicy, Layout, NameKind, NamingInput, NamingOptions,
};
use crate::progress::{null_sink, ProgressEvent, ProgressSink};
use crate::transfer_state::{ItemPhase, ItemTracker, TransferReport};
use crate::walker::TreeCopy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransferAction {
    /// Only create the target directory.
    #[default]
    CreateOnly,
    Copy,
    Move,
}

impl FromStr for TransferAction {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create-only" | "create" | "folder-only" => Ok(TransferAction::CreateOnly),
            "copy" => Ok(TransferAction::Copy),
            "move" => Ok(TransferAction::Move),
            other => Err(VaultError::InvalidRequest(format!("unknown action '{other}'"))),
        }
    }
}

/// Root every computed target is placed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Destination {
    Local { root: PathBuf },
    /// The endpoint's path is the remote root.
    Ftp { endpoint: FtpEndpoint },
}

impl Destination {
    /// FTP for `ftp://` URLs and IPv4-looking specs, a local path otherwise.
    pub fn parse(spec: &str, default_port: u16) -> Self {
        if FtpEndpoint::looks_like_ftp(spec) {
            Destination::Ftp {
                endpoint: FtpEndpoint::parse(spec, default_port),
            }
        } else {
            Destination::Local {
                root: PathBuf::from(spec.trim()),
            }
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Destination::Local { .. } => Protocol::Local,
            Destination::Ftp { .. } => Protocol::Ftp,
        }
    }

    pub fn join(&self, segments: &[String]) -> Location {
        match self {
            Destination::Local { root } => {
                let mut path = root.clone();
                path.extend(segments);
                Location::local(path)
            }
            Destination::Ftp { endpoint } => {
                Location::ftp(endpoint.clone(), join_remote(&endpoint.path, &segments.join("/")))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub items: Vec<ContentUnit>,
    pub destination: Destination,
    #[serde(default)]
    pub action: TransferAction,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub version_suffix: bool,
}

impl TransferRequest {
    pub fn new(items: Vec<ContentUnit>, destination: Destination) -> Self {
        Self {
            items,
            destination,
            action: TransferAction::default(),
            layout: Layout::default(),
            conflict: ConflictPolicy::default(),
            custom_name: None,
            version_suffix: false,
        }
    }

    pub fn with_action(mut self, action: TransferAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.layout = Layout::Custom;
        self.custom_name = Some(name.into());
        self
    }

    /// Shape checks that need no I/O.
    pub fn validate(&self) -> VaultResult<()> {
        if let Destination::Local { root } = &self.destination {
            if root.as_os_str().is_empty() {
                return Err(VaultError::InvalidRequest("no destination".into()));
            }
        }
        let custom = self.layout == Layout::Custom || self.custom_name.is_some();
        if custom && self.items.len() != 1 {
            return Err(VaultError::InvalidRequest(format!(
                "a custom name needs exactly one item, got {}",
                self.items.len()
            )));
        }
        if self.layout == Layout::Custom
            && !matches!(self.custom_name.as_deref(), Some(n) if !n.trim().is_empty())
        {
            return Err(VaultError::InvalidRequest("custom layout requires a name".into()));
        }
        Ok(())
    }
}

/// Planned target of one item as shown before a transfer starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub item: String,
    pub source: String,
    pub target: String,
    pub exists: bool,
}

/// Connections opened for one request, one per server.
struct Sessions {
    connector: Arc<dyn FtpConnector>,
    timeout: Duration,
    open: HashMap<String, SharedFtp>,
}

impl Sessions {
    fn new(connector: Arc<dyn FtpConnector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            open: HashMap::new(),
        }
    }

    async fn open(&mut self, endpoint: &FtpEndpoint) -> VaultResult<()> {
        let key = endpoint.base_url();
        if !self.open.contains_key(&key) {
            let ftp = SharedFtp::connect(Arc::clone(&self.connector), endpoint.clone(), self.timeout).await?;
            self.open.insert(key, ftp);
        }
        Ok(())
    }

    fn get(&self, endpoint: &FtpEndpoint) -> VaultResult<&SharedFtp> {
        self.open
            .get(&endpoint.base_url())
            .ok_or_else(|| VaultError::Internal(format!("no connection to {}", endpoint)))
    }

    async fn close_all(self) {
        for ftp in self.open.values() {
            ftp.close().await;
        }
    }
}

/// Per-item outcome before it is folded into the report.
type ItemEnd = (ItemPhase, Option<String>);

pub struct TransferExecutor {
    config: Arc<EngineConfig>,
    local: LocalEngine,
    connector: Arc<dyn FtpConnector>,
}

impl TransferExecutor {
    pub fn new(config: Arc<EngineConfig>, local: LocalEngine, connector: Arc<dyn FtpConnector>) -> Self {
        Self {
            config,
            local,
            connector,
        }
    }

    pub fn local_engine(&self) -> &LocalEngine {
        &self.local
    }

    fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.config.ftp.list_timeout_secs)
    }

    /// Connects to every server the request touches.
    async fn open_sessions(&self, request: &TransferRequest) -> VaultResult<Sessions> {
        let mut sessions = Sessions::new(
            Arc::clone(&self.connector),
            Duration::from_secs(self.config.ftp.connect_timeout_secs),
        );
        if let Destination::Ftp { endpoint } = &request.destination {
            sessions.open(endpoint).await?;
        }
        for item in &request.items {
            if let Location::Ftp { endpoint, .. } = &item.root {
                sessions.open(endpoint).await?;
            }
        }
        Ok(sessions)
    }

    /// Where each item would land and whether something is already there.
    /// Nothing is created or moved.
    pub async fn preview(&self, request: &TransferRequest) -> VaultResult<Vec<ConflictInfo>> {
        request.validate()?;
        let sessions = self.open_sessions(request).await?;
        let mut out = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let (source, target) = self.plan_target(request, item, &sessions).await?;
            let exists = self.exists(&target, &sessions).await?;
            out.push(ConflictInfo {
                item: item
                    .display_title
                    .clone()
                    .unwrap_or_else(|| item.folder_name.clone()),
                source: source.to_string(),
                target: target.to_string(),
                exists,
            });
        }
        sessions.close_all().await;
        Ok(out)
    }

    /// Runs every item in order. Item failures land in the report; request
    /// shape errors and FTP connection failures fail the whole call.
    pub async fn execute(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TransferReport> {
        request.validate()?;

        let sessions = self.open_sessions(request).await?;

        info!(
            "Starting {:?} of {} item(s), layout {:?}, conflicts {:?}",
            request.action,
            request.items.len(),
            request.layout,
            request.conflict
        );
        let total = request.items.len();
        let mut report = TransferReport::new();

        for (index, item) in request.items.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                for rest in &request.items[index..] {
                    report.push_not_started(rest.root.to_string());
                }
                break;
            }
            let source = item.root.to_string();
            sink.emit(ProgressEvent::ItemStart {
                item_index: index + 1,
                total_items: total,
                source: source.clone(),
            });

            let mut tracker = ItemTracker::new(index, source);
            match self
                .run_item(request, item, &mut tracker, &sessions, &sink, cancel)
                .await
            {
                Ok((terminal, detail)) => report.push(tracker.finish(terminal, detail)?),
                Err(e) => {
                    if e.is_cancelled() {
                        info!("Item {} cancelled", index + 1);
                        report.cancelled = true;
                    } else {
                        warn!("Item {} failed: {}", index + 1, e);
                    }
                    report.push(tracker.fail(&e));
                }
            }
        }

        sessions.close_all().await;
        let report = report.finish();
        info!(
            "Finished: {} succeeded, {} skipped, {} failed",
            report.counts.succeeded(),
            report.counts.skipped,
            report.counts.errors
        );
        Ok(report)
    }

    async fn run_item(
        &self,
        request: &TransferRequest,
        item: &ContentUnit,
        tracker: &mut ItemTracker,
        sessions: &Sessions,
        sink: &Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<ItemEnd> {
        tracker.advance(ItemPhase::ResolvingDescriptor)?;
        let (source, mut target) = self.plan_target(request, item, sessions).await?;
        tracker.set_target(target.to_string());
        tracker.advance(ItemPhase::TargetComputed)?;

        if request.action != TransferAction::CreateOnly {
            check_location_overlap(&source, &target)?;
        }

        if self.exists(&target, sessions).await? {
            match request.conflict {
                ConflictPolicy::Skip => {
                    info!("Skipping {}: {} exists", source, target);
                    tracker.advance(ItemPhase::ConflictChecked)?;
                    return Ok((ItemPhase::Skipped, Some("target exists".into())));
                }
                ConflictPolicy::RenameUnique => {
                    target = self.unique_target(&target, sessions).await?;
                    debug!("Target renamed to {}", target);
                    tracker.set_target(target.to_string());
                }
                ConflictPolicy::Overwrite => {
                    if same_location(&source, &target) {
                        return Err(VaultError::InvalidRequest(format!(
                            "cannot overwrite {source} with itself"
                        )));
                    }
                    if request.action != TransferAction::CreateOnly {
                        info!("Removing existing {}", target);
                        self.remove_target(&target, sessions).await?;
                    }
                }
            }
        }
        tracker.advance(ItemPhase::ConflictChecked)?;
        cancel.check()?;

        let sink = Arc::clone(sink);
        match request.action {
            TransferAction::CreateOnly => {
                self.create_target(&target, sessions).await?;
                Ok((ItemPhase::Created, None))
            }
            TransferAction::Copy => {
                let (running, done) = match target.protocol() {
                    Protocol::Ftp => (ItemPhase::Uploading, ItemPhase::Uploaded),
                    Protocol::Local => (ItemPhase::Copying, ItemPhase::Copied),
                };
                tracker.advance(running)?;
                let copied = self
                    .copy_item(&source, &target, request.conflict, sessions, sink, cancel)
                    .await?;
                tracker.add_bytes(copied.bytes);
                if copied.is_complete() {
                    Ok((done, None))
                } else {
                    warn!("Copied {} without {:?}", source, copied.unread);
                    Ok((done, Some(format!("{} unreadable director(ies) skipped", copied.unread.len()))))
                }
            }
            TransferAction::Move => {
                tracker.advance(ItemPhase::Moving)?;
                let bytes = self
                    .move_item(&source, &target, request.conflict, sessions, sink, cancel)
                    .await?;
                tracker.add_bytes(bytes);
                Ok((ItemPhase::Moved, None))
            }
        }
    }

    /// Source folder and the target before any conflict renaming.
    async fn plan_target(
        &self,
        request: &TransferRequest,
        item: &ContentUnit,
        sessions: &Sessions,
    ) -> VaultResult<(Location, Location)> {
        let descriptor = self.resolve_descriptor(item).await;
        let source = self.source_root(item, sessions).await;

        let source_basename = source.basename();
        let display_title = item
            .display_title
            .clone()
            .or_else(|| descriptor.as_ref().and_then(|d| d.display_title()));
        let identity = item
            .identity
            .clone()
            .or_else(|| descriptor.as_ref().and_then(|d| d.identity_key()));
        let content_version = item
            .content_version
            .clone()
            .or_else(|| descriptor.as_ref().and_then(|d| d.content_version.clone()));
        let naming = NamingInput {
            display_title: display_title.as_deref(),
            folder_name: Some(item.folder_name.as_str()),
            identity: identity.as_deref(),
            source_basename: source_basename.as_deref(),
            content_version: content_version.as_deref(),
        };
        let options = NamingOptions {
            layout: request.layout,
            custom_name: request.custom_name.as_deref(),
            version_suffix: request.version_suffix,
        };
        let segments = target_segments(&naming, &options)?;
        Ok((source, request.destination.join(&segments)))
    }

    /// Cached parse from discovery, else the usual places next to a local root.
    async fn resolve_descriptor(&self, item: &ContentUnit) -> Option<Arc<Descriptor>> {
        if let Some(descriptor) = &item.descriptor {
            return Some(Arc::clone(descriptor));
        }
        let root = item.root.local_path()?;
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = &item.descriptor_path {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(root.join(METADATA_DIR).join(DESCRIPTOR_FILE));
        if let Some(parent) = root.parent() {
            candidates.push(parent.join(METADATA_DIR).join(DESCRIPTOR_FILE));
        }
        for candidate in candidates {
            if let Some(descriptor) = read_descriptor(&candidate).await {
                debug!("Re-read descriptor {:?}", candidate);
                return Some(Arc::new(descriptor));
            }
        }
        None
    }

    /// The unit root, or its `<root>-app` child when the payload sits one level down.
    async fn source_root(&self, item: &ContentUnit, sessions: &Sessions) -> Location {
        let Some(name) = item.root.basename() else {
            return item.root.clone();
        };
        let nested = format!("{name}-app");
        match &item.root {
            Location::Local { path } => {
                let candidate = path.join(&nested);
                if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_dir()) {
                    debug!("Using nested app folder {:?}", candidate);
                    return Location::local(candidate);
                }
            }
            Location::Ftp { endpoint, path } => {
                let Ok(ftp) = sessions.get(endpoint) else {
                    return item.root.clone();
                };
                if let Ok(entries) = list_dir(ftp, path, self.list_timeout()).await {
                    if let Some(entry) = entries
                        .iter()
                        .find(|e| e.is_dir() && e.name.eq_ignore_ascii_case(&nested))
                    {
                        debug!("Using nested app folder {}/{}", path, entry.name);
                        return Location::ftp(endpoint.clone(), join_remote(path, &entry.name));
                    }
                }
            }
        }
        item.root.clone()
    }

    async fn exists(&self, location: &Location, sessions: &Sessions) -> VaultResult<bool> {
        match location {
            Location::Local { path } => Ok(tokio::fs::symlink_metadata(path).await.is_ok()),
            Location::Ftp { endpoint, path } => remote_exists(sessions.get(endpoint)?, path).await,
        }
    }

    async fn unique_target(&self, location: &Location, sessions: &Sessions) -> VaultResult<Location> {
        let max = self.config.unique_name_attempts;
        match location {
            Location::Local { path } => {
                let unique = ensure_unique_target(path, max, |candidate| {
                    std::fs::symlink_metadata(candidate).is_ok()
                })?;
                Ok(Location::local(unique))
            }
            Location::Ftp { endpoint, path } => {
                let ftp = sessions.get(endpoint)?;
                let parent = remote_parent(path);
                let taken: Vec<String> = list_dir(ftp, &parent, self.list_timeout())
                    .await?
                    .into_iter()
                    .map(|e| e.name)
                    .collect();
                let name = remote_basename(path)
                    .ok_or_else(|| VaultError::InvalidPath(path.clone()))?;
                let chosen = unique_name(name, NameKind::Dir, max, |candidate| {
                    taken.iter().any(|t| t == candidate)
                })?;
                Ok(Location::ftp(endpoint.clone(), join_remote(&parent, &chosen)))
            }
        }
    }

    async fn remove_target(&self, location: &Location, sessions: &Sessions) -> VaultResult<()> {
        match location {
            Location::Local { path } => remove_tree(path).await,
            Location::Ftp { endpoint, path } => delete_remote_tree(sessions.get(endpoint)?, path).await,
        }
    }

    async fn create_target(&self, location: &Location, sessions: &Sessions) -> VaultResult<()> {
        match location {
            Location::Local { path } => Ok(tokio::fs::create_dir_all(path).await?),
            Location::Ftp { endpoint, path } => ensure_remote_dir(sessions.get(endpoint)?, path).await,
        }
    }

    /// A staging directory next to `near` when given, else under the staging root.
    fn staging_dir(&self, near: Option<&Path>) -> VaultResult<TempDir> {
        let parent = match near.and_then(Path::parent) {
            Some(parent) => parent.to_path_buf(),
            None => self.config.staging_root(),
        };
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new()
            .prefix(".ps5vault-stage-")
            .tempdir_in(&parent)?;
        debug!("Staging through {:?}", dir.path());
        Ok(dir)
    }

    /// Downloads a remote tree into a staging area, then moves it to `target`.
    /// With `strict` an incomplete remote listing fails before any download.
    #[allow(clippy::too_many_arguments)]
    async fn download_to_local(
        &self,
        ftp: &SharedFtp,
        remote: &str,
        target: &Path,
        conflict: ConflictPolicy,
        strict: bool,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TreeCopy> {
        let staging = self.staging_dir(Some(target))?;
        let staged = staging.path().join("tree");
        let copied = download_tree(ftp, remote, &staged, strict, sink, cancel, self.list_timeout()).await?;
        self.local
            .move_tree(&staged, target, conflict, null_sink(), cancel)
            .await?;
        Ok(copied)
    }

    /// Remote to remote through a local staging copy.
    #[allow(clippy::too_many_arguments)]
    async fn bridge_remote(
        &self,
        from: &SharedFtp,
        remote_src: &str,
        to: &SharedFtp,
        remote_dst: &str,
        strict: bool,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TreeCopy> {
        let staging = self.staging_dir(None)?;
        let staged = staging.path().join("tree");
        let copied = download_tree(from, remote_src, &staged, strict, sink, cancel, self.list_timeout()).await?;
        upload_tree(to, &staged, remote_dst, true, null_sink(), cancel).await?;
        Ok(copied)
    }

    /// Copies an item. Unreadable source directories are left out and
    /// reported in the result.
    async fn copy_item(
        &self,
        source: &Location,
        target: &Location,
        conflict: ConflictPolicy,
        sessions: &Sessions,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TreeCopy> {
        match (source, target) {
            (Location::Local { path: src }, Location::Local { path: dst }) => {
                self.local.copy_tree(src, dst, conflict, sink, cancel).await
            }
            (Location::Local { path: src }, Location::Ftp { endpoint, path: dst }) => {
                upload_tree(sessions.get(endpoint)?, src, dst, false, sink, cancel).await
            }
            (Location::Ftp { endpoint, path: src }, Location::Local { path: dst }) => {
                let ftp = sessions.get(endpoint)?;
                self.download_to_local(ftp, src, dst, conflict, false, sink, cancel)
                    .await
            }
            (
                Location::Ftp {
                    endpoint: src_endpoint,
                    path: src,
                },
                Location::Ftp {
                    endpoint: dst_endpoint,
                    path: dst,
                },
            ) => {
                let from = sessions.get(src_endpoint)?;
                let to = sessions.get(dst_endpoint)?;
                self.bridge_remote(from, src, to, dst, false, sink, cancel).await
            }
        }
    }

    /// Moves an item. The source is only deleted after a transfer whose
    /// listing covered the whole tree.
    async fn move_item(
        &self,
        source: &Location,
        target: &Location,
        conflict: ConflictPolicy,
        sessions: &Sessions,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<u64> {
        match (source, target) {
            (Location::Local { path: src }, Location::Local { path: dst }) => {
                self.local.move_tree(src, dst, conflict, sink, cancel).await
            }
            (Location::Local { path: src }, Location::Ftp { endpoint, path: dst }) => {
                let copied = upload_tree(sessions.get(endpoint)?, src, dst, true, sink, cancel).await?;
                remove_tree(src).await?;
                Ok(copied.bytes)
            }
            (Location::Ftp { endpoint, path: src }, Location::Local { path: dst }) => {
                let ftp = sessions.get(endpoint)?;
                let copied = self
                    .download_to_local(ftp, src, dst, conflict, true, sink, cancel)
                    .await?;
                delete_remote_tree(ftp, src).await?;
                Ok(copied.bytes)
            }
            (
                Location::Ftp {
                    endpoint: src_endpoint,
                    path: src,
                },
                Location::Ftp {
                    endpoint: dst_endpoint,
                    path: dst,
                },
            ) => {
                let from = sessions.get(src_endpoint)?;
                let to = sessions.get(dst_endpoint)?;
                if src_endpoint.same_server(dst_endpoint) {
                    let renamed = match ensure_remote_dir(to, &remote_parent(dst)).await {
                        Ok(()) => rename_remote(to, src, dst).await,
                        Err(e) => Err(e),
                    };
                    match renamed {
                        Ok(()) => {
                            info!("Moved {} to {} by remote rename", src, dst);
                            return Ok(0);
                        }
                        Err(e) => warn!("Remote rename {} -> {} failed ({}), copying", src, dst, e),
                    }
                }
                let copied = self.bridge_remote(from, src, to, dst, true, sink, cancel).await?;
                delete_remote_tree(from, src).await?;
                Ok(copied.bytes)
            }
        }
    }
}

/// Overlap guard for source and target on one filesystem or server.
fn check_location_overlap(source: &Location, target: &Location) -> VaultResult<()> {
    match (source, target) {
        (Location::Local { path: src }, Location::Local { path: dst }) => check_overlap(src, dst),
        (
            Location::Ftp {
                endpoint: a,
                path: src,
            },
            Location::Ftp {
                endpoint: b,
                path: dst,
            },
        ) if a.same_server(b) => check_overlap_remote(src, dst),
        _ => Ok(()),
    }
}

fn same_location(a: &Location, b: &Location) -> bool {
    match (a, b) {
        (Location::Local { path: x }, Location::Local { path: y }) => {
            normalize_lexically(x) == normalize_lexically(y)
        }
        (
            Location::Ftp {
                endpoint: ea,
                path: x,
            },
            Location::Ftp {
                endpoint: eb,
                path: y,
            },
        ) => ea.same_server(eb) && normalize_remote(x) == normalize_remote(y),
        _ => false,
    }
}
