//! FTP access.
//!
//! The protocol itself is delegated to a blocking [`FtpClient`]. One
//! operation owns one connection, wrapped in [`SharedFtp`]: every command
//! goes through an async mutex and runs on the blocking pool, so commands on
//! the control channel never interleave.

pub mod address;
pub mod listing;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod native;
pub mod transfer;
pub mod walker;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{VaultError, VaultResult};
use address::FtpEndpoint;
pub use listing::{RemoteEntry, RemoteKind};

/// Blocking FTP client. Paths are absolute remote paths.
pub trait FtpClient: Send {
    /// Directory entries without `.` and `..`.
    fn list(&mut self, path: &str) -> VaultResult<Vec<RemoteEntry>>;
    fn cwd(&mut self, path: &str) -> VaultResult<()>;
    fn mkdir(&mut self, path: &str) -> VaultResult<()>;
    /// Writes the remote file to `local`, returning the byte count.
    fn download(&mut self, remote: &str, local: &Path) -> VaultResult<u64>;
    fn upload(&mut self, local: &Path, remote: &str) -> VaultResult<u64>;
    fn delete_file(&mut self, path: &str) -> VaultResult<()>;
    fn remove_dir(&mut self, path: &str) -> VaultResult<()>;
    fn rename(&mut self, from: &str, to: &str) -> VaultResult<()>;
    fn quit(&mut self) {}
}

/// Opens connections. Swapped for an in-memory server in tests.
pub trait FtpConnector: Send + Sync {
    fn connect(&self, endpoint: &FtpEndpoint) -> VaultResult<Box<dyn FtpClient>>;
}

/// One logical connection, serialized behind an async mutex.
#[derive(Clone)]
pub struct SharedFtp {
    endpoint: FtpEndpoint,
    client: Arc<Mutex<Box<dyn FtpClient>>>,
}

impl SharedFtp {
    pub fn new(endpoint: FtpEndpoint, client: Box<dyn FtpClient>) -> Self {
        Self {
            endpoint,
            client: Arc::new(Mutex::new(client)),
        }
    }

    /// Connects on the blocking pool, giving up after `timeout`.
    pub async fn connect(
        connector: Arc<dyn FtpConnector>,
        endpoint: FtpEndpoint,
        timeout: Duration,
    ) -> VaultResult<Self> {
        info!("Connecting to {}", endpoint);
        let target = endpoint.clone();
        let attempt = tokio::task::spawn_blocking(move || connector.connect(&target));
        let client = match tokio::time::timeout(timeout, attempt).await {
            Ok(joined) => joined?.map_err(|e| match e {
                VaultError::FtpConnect { .. } => e,
                other => VaultError::FtpConnect {
                    endpoint: endpoint.to_string(),
                    message: other.to_string(),
                },
            })?,
            Err(_) => {
                return Err(VaultError::FtpConnect {
                    endpoint: endpoint.to_string(),
                    message: format!("no answer within {}s", timeout.as_secs()),
                })
            }
        };
        Ok(Self::new(endpoint, client))
    }

    pub fn endpoint(&self) -> &FtpEndpoint {
        &self.endpoint
    }

    /// Runs `op` with exclusive use of the connection.
    pub async fn run<T, F>(&self, op: F) -> VaultResult<T>
    where
        F: FnOnce(&mut dyn FtpClient) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = Arc::clone(&self.client).lock_owned().await;
        tokio::task::spawn_blocking(move || op(&mut **guard)).await?
    }

    /// Like [`run`](Self::run), failing with `Timeout` after `limit`. The
    /// command keeps the connection until it returns on its own.
    pub async fn run_timeout<T, F>(&self, limit: Duration, what: &str, op: F) -> VaultResult<T>
    where
        F: FnOnce(&mut dyn FtpClient) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        with_timeout(limit, what, self.run(op)).await
    }

    /// Closes the control connection once no command holds it.
    pub async fn close(&self) {
        let _ = self
            .run(|client| {
                client.quit();
                Ok(())
            })
            .await;
        debug!("Closed connection to {}", self.endpoint);
    }
}

pub(crate) async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = VaultResult<T>>,
) -> VaultResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VaultError::Timeout(format!(
            "{what} took longer than {}s",
            limit.as_secs()
        ))),
    }
}

/// Absolute, `/`-separated, without `.`/`..`, empty segments or a trailing slash.
pub fn normalize_remote(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn join_remote(base: &str, child: &str) -> String {
    normalize_remote(&format!("{}/{}", base, child))
}

pub fn remote_basename(path: &str) -> Option<&str> {
    path.trim_end_matches('/').rsplit('/').next().filter(|s| !s.is_empty())
}

pub fn remote_parent(path: &str) -> String {
    let normalized = normalize_remote(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Remote path for a relative local path.
pub fn remote_child(base: &str, rel: &Path) -> String {
    let rel: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    join_remote(base, &rel.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::memory::MemoryServer;

    #[test]
    fn test_remote_paths() {
        assert_eq!(normalize_remote("mnt//ext1/./games/"), "/mnt/ext1/games");
        assert_eq!(normalize_remote("/a/b/../c"), "/a/c");
        assert_eq!(normalize_remote(""), "/");
        assert_eq!(join_remote("/data", "etaHEN/games"), "/data/etaHEN/games");
        assert_eq!(remote_basename("/data/games/X/"), Some("X"));
        assert_eq!(remote_basename("/"), None);
        assert_eq!(remote_parent("/data/games"), "/data");
        assert_eq!(remote_parent("/data"), "/");
        assert_eq!(remote_child("/up", Path::new("a/b.bin")), "/up/a/b.bin");
    }

    #[tokio::test]
    async fn test_commands_are_serialized() {
        let server = MemoryServer::new();
        server.set_command_delay(Duration::from_millis(2));
        server.add_dir("/data/games");
        let ftp = SharedFtp::new(FtpEndpoint::parse("127.0.0.1", 2121), server.client());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let ftp = ftp.clone();
            tasks.push(tokio::spawn(async move {
                let dir = format!("/data/games/g{i}");
                ftp.run(move |c| c.mkdir(&dir)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(server.overlapping_commands(), 0);
        assert_eq!(server.list_names("/data/games").len(), 8);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connect_error() {
        let server = MemoryServer::new();
        server.refuse_connections(true);
        let err = SharedFtp::connect(
            Arc::new(server.connector()),
            FtpEndpoint::parse("10.0.0.9", 2121),
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, VaultError::FtpConnect { .. }));
    }
}
