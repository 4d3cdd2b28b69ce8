//! In-process FTP server for tests.
//!
//! Holds a tree of directories and files in memory and counts commands that
//! arrive while another is still running, which a correctly serialized
//! caller never produces.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::address::FtpEndpoint;
use super::listing::RemoteEntry;
use super::{normalize_remote, remote_parent, FtpClient, FtpConnector};
use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// What happens to one `LIST` of a given directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFault {
    Pass,
    Fail,
    /// Answers normally after holding the connection this long.
    Stall(Duration),
}

#[derive(Default)]
struct ServerState {
    nodes: Mutex<BTreeMap<String, Node>>,
    busy: AtomicBool,
    overlaps: AtomicUsize,
    commands: AtomicUsize,
    renames: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    delay: Mutex<Duration>,
    refuse: AtomicBool,
    fail_rename: AtomicBool,
    read_only: Mutex<Vec<String>>,
    list_faults: Mutex<HashMap<String, VecDeque<ListFault>>>,
}

/// Shared handle to one in-memory filesystem.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

fn is_below(path: &str, dir: &str) -> bool {
    dir == "/" || path == dir || path.starts_with(&format!("{dir}/"))
}

impl MemoryServer {
    pub fn new() -> Self {
        let server = Self::default();
        server.state.nodes.lock().insert("/".into(), Node::Dir);
        server
    }

    /// Creates a directory and its ancestors.
    pub fn add_dir(&self, path: &str) {
        let path = normalize_remote(path);
        let mut nodes = self.state.nodes.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = format!("{current}/{segment}");
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = normalize_remote(path);
        self.add_dir(&remote_parent(&path));
        self.state.nodes.lock().insert(path, Node::File(data.into()));
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.nodes.lock().get(&normalize_remote(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.nodes.lock().contains_key(&normalize_remote(path))
    }

    /// Names directly inside `dir`, sorted.
    pub fn list_names(&self, dir: &str) -> Vec<String> {
        let dir = normalize_remote(dir);
        let nodes = self.state.nodes.lock();
        nodes
            .keys()
            .filter(|p| p.as_str() != dir && super::remote_parent(p) == dir)
            .filter_map(|p| super::remote_basename(p).map(str::to_string))
            .collect()
    }

    pub fn set_command_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_renames(&self, fail: bool) {
        self.state.fail_rename.store(fail, Ordering::SeqCst);
    }

    /// Applies `faults` to the next listings of `dir`, one per `LIST`.
    pub fn queue_list_faults(&self, dir: &str, faults: impl IntoIterator<Item = ListFault>) {
        self.state
            .list_faults
            .lock()
            .entry(normalize_remote(dir))
            .or_default()
            .extend(faults);
    }

    /// Rejects MKD and STOR anywhere below `path`.
    pub fn make_read_only(&self, path: &str) {
        self.state.read_only.lock().push(normalize_remote(path));
    }

    pub fn overlapping_commands(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    pub fn command_count(&self) -> usize {
        self.state.commands.load(Ordering::SeqCst)
    }

    pub fn rename_count(&self) -> usize {
        self.state.renames.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.state.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> Box<dyn FtpClient> {
        Box::new(MemoryFtp {
            server: self.clone(),
        })
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }
}

/// Marks the server busy for the duration of one command.
struct CommandGuard<'a> {
    state: &'a ServerState,
}

impl<'a> CommandGuard<'a> {
    fn enter(state: &'a ServerState) -> Self {
        state.commands.fetch_add(1, Ordering::SeqCst);
        if state.busy.swap(true, Ordering::SeqCst) {
            state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *state.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Self { state }
    }
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.state.busy.store(false, Ordering::SeqCst);
    }
}

pub struct MemoryFtp {
    server: MemoryServer,
}

fn not_found(path: &str) -> VaultError {
    VaultError::Ftp(format!("550 {path}: No such file or directory"))
}

impl MemoryFtp {
    fn state(&self) -> &ServerState {
        &self.server.state
    }

    fn writable(&self, path: &str) -> VaultResult<()> {
        if self.state().read_only.lock().iter().any(|ro| is_below(path, ro)) {
            Err(VaultError::Ftp(format!("550 {path}: Permission denied")))
        } else {
            Ok(())
        }
    }

    fn require_dir(nodes: &BTreeMap<String, Node>, path: &str) -> VaultResult<()> {
        match nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            _ => Err(not_found(path)),
        }
    }
}

impl FtpClient for MemoryFtp {
    fn list(&mut self, path: &str) -> VaultResult<Vec<RemoteEntry>> {
        let _cmd = CommandGuard::enter(self.state());
        let path = normalize_remote(path);
        let fault = self
            .state()
            .list_faults
            .lock()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(ListFault::Fail) => return Err(VaultError::Ftp(format!("451 {path}: Requested action aborted"))),
            Some(ListFault::Stall(delay)) => std::thread::sleep(delay),
            Some(ListFault::Pass) | None => {}
        }
        let nodes = self.state().nodes.lock();
        Self::require_dir(&nodes, &path)?;
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != path && remote_parent(p) == path)
            .filter_map(|(p, node)| {
                let name = super::remote_basename(p)?;
                Some(match node {
                    Node::Dir => RemoteEntry::dir(name),
                    Node::File(data) => RemoteEntry::file(name, data.len() as u64),
                })
            })
            .collect())
    }

    fn cwd(&mut self, path: &str) -> VaultResult<()> {
        let _cmd = CommandGuard::enter(self.state());
        let nodes = self.state().nodes.lock();
        Self::require_dir(&nodes, &normalize_remote(path))
    }

    fn mkdir(&mut self, path: &str) -> VaultResult<()> {
        let _cmd = CommandGuard::enter(self.state());
        let path = normalize_remote(path);
        self.writable(&path)?;
        let mut nodes = self.state().nodes.lock();
        Self::require_dir(&nodes, &remote_parent(&path))?;
        if nodes.contains_key(&path) {
            return Err(VaultError::Ftp(format!("550 {path}: File exists")));
        }
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn download(&mut self, remote: &str, local: &Path) -> VaultResult<u64> {
        let _cmd = CommandGuard::enter(self.state());
        let remote = normalize_remote(remote);
        let data = match self.state().nodes.lock().get(&remote) {
            Some(Node::File(data)) => data.clone(),
            _ => return Err(not_found(&remote)),
        };
        std::fs::write(local, &data)?;
        self.state().downloads.fetch_add(1, Ordering::SeqCst);
        Ok(data.len() as u64)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> VaultResult<u64> {
        let _cmd = CommandGuard::enter(self.state());
        let remote = normalize_remote(remote);
        self.writable(&remote)?;
        let data = std::fs::read(local)?;
        let size = data.len() as u64;
        let mut nodes = self.state().nodes.lock();
        Self::require_dir(&nodes, &remote_parent(&remote))?;
        if matches!(nodes.get(&remote), Some(Node::Dir)) {
            return Err(VaultError::Ftp(format!("553 {remote}: Is a directory")));
        }
        nodes.insert(remote, Node::File(data));
        self.state().uploads.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }

    fn delete_file(&mut self, path: &str) -> VaultResult<()> {
        let _cmd = CommandGuard::enter(self.state());
        let path = normalize_remote(path);
        let mut nodes = self.state().nodes.lock();
        match nodes.get(&path) {
            Some(Node::File(_)) => {
                nodes.remove(&path);
                Ok(())
            }
            _ => Err(not_found(&path)),
        }
    }

    fn remove_dir(&mut self, path: &str) -> VaultResult<()> {
        let _cmd = CommandGuard::enter(self.state());
        let path = normalize_remote(path);
        let mut nodes = self.state().nodes.lock();
        Self::require_dir(&nodes, &path)?;
        if nodes.keys().any(|p| p != &path && is_below(p, &path)) {
            return Err(VaultError::Ftp(format!("550 {path}: Directory not empty")));
        }
        nodes.remove(&path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> VaultResult<()> {
        let _cmd = CommandGuard::enter(self.state());
        if self.state().fail_rename.load(Ordering::SeqCst) {
            return Err(VaultError::Ftp("502 RNFR not implemented".into()));
        }
        let from = normalize_remote(from);
        let to = normalize_remote(to);
        let mut nodes = self.state().nodes.lock();
        if !nodes.contains_key(&from) {
            return Err(not_found(&from));
        }
        Self::require_dir(&nodes, &remote_parent(&to))?;
        if nodes.contains_key(&to) {
            return Err(VaultError::Ftp(format!("550 {to}: File exists")));
        }
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| is_below(p, &from) && from != "/")
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        self.state().renames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl FtpConnector for MemoryConnector {
    fn connect(&self, endpoint: &FtpEndpoint) -> VaultResult<Box<dyn FtpClient>> {
        if self.server.state.refuse.load(Ordering::SeqCst) {
            return Err(VaultError::FtpConnect {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            });
        }
        Ok(self.server.client())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_operations() {
        let server = MemoryServer::new();
        server.add_file("/data/games/X/sce_sys/param.json", b"{}".to_vec());
        let mut client = server.client();

        let entries = client.list("/data/games/X").unwrap();
        assert_eq!(entries, vec![RemoteEntry::dir("sce_sys")]);
        assert!(client.cwd("/data/games/Y").is_err());

        client.rename("/data/games/X", "/data/games/Z").unwrap();
        assert!(server.exists("/data/games/Z/sce_sys/param.json"));
        assert!(!server.exists("/data/games/X"));

        assert!(client.remove_dir("/data/games/Z").is_err());
        client.delete_file("/data/games/Z/sce_sys/param.json").unwrap();
        client.remove_dir("/data/games/Z/sce_sys").unwrap();
        client.remove_dir("/data/games/Z").unwrap();
        assert!(server.list_names("/data/games").is_empty());
    }

    #[test]
    fn test_list_faults_apply_in_order() {
        let server = MemoryServer::new();
        server.add_dir("/mnt/ext1");
        server.queue_list_faults("/mnt/ext1/", [ListFault::Pass, ListFault::Fail]);
        let mut client = server.client();
        assert!(client.list("/mnt/ext1").is_ok());
        assert!(client.list("/mnt/ext1").is_err());
        assert!(client.list("/mnt/ext1").is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let server = MemoryServer::new();
        server.add_dir("/mnt/usb0");
        server.make_read_only("/mnt/usb0");
        let mut client = server.client();
        assert!(client.mkdir("/mnt/usb0/games").is_err());
        assert!(client.mkdir("/mnt/other").is_ok());
    }

    #[test]
    fn test_transfer_files() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("blob");
        std::fs::write(&local, vec![7u8; 300]).unwrap();

        let server = MemoryServer::new();
        let mut client = server.client();
        assert_eq!(client.upload(&local, "/blob").unwrap(), 300);
        let back = dir.path().join("back");
        assert_eq!(client.download("/blob", &back).unwrap(), 300);
        assert_eq!(std::fs::read(back).unwrap(), vec![7u8; 300]);
        assert_eq!(server.upload_count(), 1);
        assert_eq!(server.download_count(), 1);
    }
}
