//! ps5vault backend library.
//!
//! [`Vault`] is the surface a front end talks to: scan a source, preview
//! conflicts, run a transfer and cancel it. Everything below it is usable on
//! its own.

pub mod cancel;
pub mod config;
pub mod content;
pub mod descriptor;
pub mod discovery;
pub mod errors;
pub mod file_ops;
pub mod ftp;
pub mod path_policy;
pub mod progress;
pub mod transfer_engine;
pub mod transfer_state;
pub mod walker;

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cancel::{CancelToken, CancellationRegistry, OperationHandle, OperationId};
use crate::config::EngineConfig;
use crate::content::{ContentSize, ContentUnit, Location};
use crate::discovery::LocalDiscovery;
use crate::errors::{VaultError, VaultResult};
use crate::file_ops::LocalEngine;
use crate::ftp::address::FtpEndpoint;
use crate::ftp::native::NativeConnector;
use crate::ftp::walker::{remote_tree_size, SizeCache, SizeLimits};
use crate::ftp::{FtpConnector, SharedFtp};
use crate::progress::ProgressSink;
use crate::transfer_engine::{ConflictInfo, TransferExecutor, TransferRequest};
use crate::transfer_state::TransferReport;

/// Existence check result for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCheck {
    pub path: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Vault {
    config: Arc<EngineConfig>,
    executor: TransferExecutor,
    connector: Arc<dyn FtpConnector>,
    registry: Arc<CancellationRegistry>,
    sizes: SizeCache,
}

impl Vault {
    /// Vault over the real filesystem and real FTP connections.
    pub fn new(config: EngineConfig) -> VaultResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let local = LocalEngine::new(Arc::clone(&config));
        Ok(Self::with_parts(config, local, Arc::new(NativeConnector)))
    }

    /// Vault with an injected local engine and FTP connector.
    pub fn with_parts(config: Arc<EngineConfig>, local: LocalEngine, connector: Arc<dyn FtpConnector>) -> Self {
        Self {
            executor: TransferExecutor::new(Arc::clone(&config), local, Arc::clone(&connector)),
            config,
            connector,
            registry: CancellationRegistry::new(),
            sizes: SizeCache::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_engine(&self) -> &LocalEngine {
        self.executor.local_engine()
    }

    /// Registers a new operation. Pass its token to a scan or transfer and
    /// keep the handle alive until the call returns.
    pub fn begin_operation(&self) -> OperationHandle {
        self.registry.begin()
    }

    pub fn cancel_operation(&self, id: &OperationId) -> bool {
        self.registry.cancel(id)
    }

    /// Cancels everything in flight. Returns how many operations were signalled.
    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    pub fn active_operations(&self) -> usize {
        self.registry.active()
    }

    async fn connect(&self, endpoint: FtpEndpoint) -> VaultResult<SharedFtp> {
        SharedFtp::connect(
            Arc::clone(&self.connector),
            endpoint,
            Duration::from_secs(self.config.ftp.connect_timeout_secs),
        )
        .await
    }

    /// Discovers content units under a local directory or an FTP spec.
    pub async fn scan_source(
        &self,
        source: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<Vec<ContentUnit>> {
        let source = source.trim();
        if source.is_empty() {
            return Err(VaultError::InvalidRequest("empty source".into()));
        }

        if FtpEndpoint::looks_like_ftp(source) {
            let endpoint = FtpEndpoint::parse(source, self.config.ftp.default_port);
            let ftp = self.connect(endpoint).await?;
            let result = discovery::ftp::discover_ftp(&self.config, &ftp, sink, cancel).await;
            ftp.close().await;
            return result;
        }

        let root = Path::new(source);
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(VaultError::SourceNotFound(format!("{source} is not a directory"))),
            Err(_) => return Err(VaultError::SourceNotFound(source.to_string())),
        }
        LocalDiscovery::new(Arc::clone(&self.config))?
            .discover(root, sink, cancel)
            .await
    }

    /// Creates, copies or moves every item of `request`.
    pub async fn ensure_and_populate(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> VaultResult<TransferReport> {
        let report = self.executor.execute(request, sink, cancel).await?;
        if report.cancelled {
            warn!("Transfer was cancelled after {} item(s)", report.counts.succeeded());
        }
        Ok(report)
    }

    /// Targets the request would write to and which of them already exist.
    pub async fn check_conflicts(&self, request: &TransferRequest) -> VaultResult<Vec<ConflictInfo>> {
        self.executor.preview(request).await
    }

    /// Local existence check for each path. Never fails as a whole.
    pub async fn check_paths_exist(&self, paths: &[String]) -> Vec<PathCheck> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let check = match tokio::fs::symlink_metadata(path).await {
                Ok(_) => PathCheck {
                    path: path.clone(),
                    exists: true,
                    error: None,
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => PathCheck {
                    path: path.clone(),
                    exists: false,
                    error: None,
                },
                Err(e) => PathCheck {
                    path: path.clone(),
                    exists: false,
                    error: Some(e.to_string()),
                },
            };
            out.push(check);
        }
        out
    }

    /// Bounded size of a unit's tree. Remote sizes are cached per server and path.
    pub async fn content_size(&self, unit: &ContentUnit, cancel: &CancelToken) -> VaultResult<ContentSize> {
        match &unit.root {
            Location::Local { path } => walker::tree_size(path, self.config.size_file_cap, cancel).await,
            Location::Ftp { endpoint, path } => {
                let ftp = self.connect(endpoint.clone()).await?;
                let limits = SizeLimits {
                    max_depth: self.config.ftp.size_max_depth,
                    file_cap: self.config.size_file_cap,
                    list_timeout: Duration::from_secs(self.config.ftp.list_timeout_secs),
                };
                let size = remote_tree_size(&ftp, path, limits, &self.sizes, cancel).await;
                ftp.close().await;
                let size = size?;
                info!("Size of {}: {}", unit.root, size);
                Ok(size)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::memory::MemoryServer;
    use crate::progress::null_sink;
    use std::fs;

    fn vault(server: &MemoryServer) -> Vault {
        let config = Arc::new(EngineConfig::default());
        Vault::with_parts(
            Arc::clone(&config),
            LocalEngine::new(config),
            Arc::new(server.connector()),
        )
    }

    #[tokio::test]
    async fn test_scan_rejects_missing_and_file_sources() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();
        let vault = vault(&MemoryServer::new());

        for source in [dir.path().join("absent"), file] {
            let err = vault
                .scan_source(&source.display().to_string(), null_sink(), &CancelToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, VaultError::SourceNotFound(_)));
        }
        assert!(vault.scan_source("  ", null_sink(), &CancelToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_ftp_connection_failure_is_fatal() {
        let server = MemoryServer::new();
        server.refuse_connections(true);
        let err = vault(&server)
            .scan_source("192.168.1.20:2121", null_sink(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::FtpConnect { .. }));
    }

    #[tokio::test]
    async fn test_check_paths_exist() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().display().to_string();
        let absent = dir.path().join("nope").display().to_string();
        let checks = vault(&MemoryServer::new())
            .check_paths_exist(&[present.clone(), absent.clone()])
            .await;
        assert_eq!(
            checks,
            vec![
                PathCheck { path: present, exists: true, error: None },
                PathCheck { path: absent, exists: false, error: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_size_is_cached() {
        let server = MemoryServer::new();
        server.add_file("/data/games/X/a.bin", vec![0u8; 100]);
        server.add_file("/data/games/X/b/c.bin", vec![0u8; 50]);
        let vault = vault(&server);
        let endpoint = FtpEndpoint::parse("10.0.0.5", 2121);
        let unit = ContentUnit::new(Location::ftp(endpoint, "/data/games/X"), None, None, None);

        let size = vault.content_size(&unit, &CancelToken::new()).await.unwrap();
        assert_eq!(size, ContentSize::Exact(150));
        let commands = server.command_count();
        let again = vault.content_size(&unit, &CancelToken::new()).await.unwrap();
        assert_eq!(again, size);
        // served from the cache, nothing listed
        assert_eq!(server.command_count(), commands);
    }

    #[tokio::test]
    async fn test_ftp_scan_and_download() {
        use crate::path_policy::Layout;
        use crate::transfer_engine::{Destination, TransferAction};

        let server = MemoryServer::new();
        server.add_file(
            "/data/etaHEN/games/PPSA00009/sce_sys/param.json",
            br#"{"titleName":"Remote Game","contentId":"UP0001-PPSA00009_00-0000000000000000"}"#.to_vec(),
        );
        server.add_file("/data/etaHEN/games/PPSA00009/eboot.bin", vec![5u8; 2048]);
        let vault = vault(&server);
        let dst = tempfile::tempdir().unwrap();

        let units = vault
            .scan_source("192.168.0.50", null_sink(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].root, Location::Ftp { .. }));

        let request = TransferRequest::new(
            units,
            Destination::Local {
                root: dst.path().to_path_buf(),
            },
        )
        .with_action(TransferAction::Copy)
        .with_layout(Layout::IdOnly);
        let report = vault
            .ensure_and_populate(&request, null_sink(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.counts.copied, 1, "{:?}", report.items);
        assert_eq!(fs::read(dst.path().join("PPSA00009/eboot.bin")).unwrap(), vec![5u8; 2048]);
        assert!(server.exists("/data/etaHEN/games/PPSA00009/eboot.bin"));
    }

    #[tokio::test]
    async fn test_operations_register_and_cancel() {
        let vault = vault(&MemoryServer::new());
        let handle = vault.begin_operation();
        assert_eq!(vault.active_operations(), 1);
        assert!(vault.cancel_operation(&handle.id()));
        assert!(handle.token().is_cancelled());
        drop(handle);
        assert_eq!(vault.active_operations(), 0);
        assert_eq!(vault.cancel_all(), 0);
    }
}
