//! Tree transfers between a [`SharedFtp`] connection and the local disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::walker::list_tree;
use super::{join_remote, normalize_remote, remote_basename, remote_child, remote_parent, FtpClient, SharedFtp};
use crate::cancel::CancelToken;
use crate::errors::{VaultError, VaultResult};
use crate::progress::{ProgressSink, TreeProgress};
use crate::walker::{require_complete, TreeCopy};

/// Downloads `remote_root` into `local_root` one file at a time.
///
/// Subdirectories whose listing fails are left out and reported in the
/// result; with `strict` they fail the call before anything is written.
pub async fn download_tree(
    ftp: &SharedFtp,
    remote_root: &str,
    local_root: &Path,
    strict: bool,
    sink: Arc<dyn ProgressSink>,
    cancel: &CancelToken,
    list_timeout: Duration,
) -> VaultResult<TreeCopy> {
    let remote_root = normalize_remote(remote_root);
    let listing = list_tree(ftp, &remote_root, cancel, list_timeout).await?;
    let source = format!("{}{}", ftp.endpoint().base_url(), remote_root);
    if strict {
        require_complete(&source, &listing.unread)?;
    } else if !listing.is_complete() {
        warn!("Downloading {} without unreadable {:?}", source, listing.unread);
    }
    info!(
        "Downloading {} files ({} bytes) from {}",
        listing.files.len(),
        listing.total_bytes,
        remote_root
    );

    tokio::fs::create_dir_all(local_root).await?;
    for dir in &listing.dirs {
        tokio::fs::create_dir_all(local_root.join(dir)).await?;
    }

    let mut progress = TreeProgress::start(sink, listing.files.len(), listing.total_bytes);
    for file in listing.files {
        cancel.check()?;
        let remote = join_remote(&remote_root, &file.rel_path);
        let local = local_root.join(&file.rel_path);
        let written = ftp.run(move |client| client.download(&remote, &local)).await?;
        progress.file_done(file.rel_path, written);
    }
    Ok(TreeCopy {
        bytes: progress.finish(),
        unread: listing.unread,
    })
}

/// Creates `path` and any missing ancestors. A directory that can be neither
/// entered nor created is reported as inaccessible.
pub async fn ensure_remote_dir(ftp: &SharedFtp, path: &str) -> VaultResult<()> {
    let path = normalize_remote(path);
    ftp.run(move |client| ensure_dir_blocking(client, &path)).await
}

fn ensure_dir_blocking(client: &mut dyn FtpClient, path: &str) -> VaultResult<()> {
    if client.cwd(path).is_ok() {
        return Ok(());
    }
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = format!("{current}/{segment}");
        if client.cwd(&current).is_ok() {
            continue;
        }
        if let Err(e) = client.mkdir(&current) {
            // another client may have created it in between
            if client.cwd(&current).is_err() {
                return Err(VaultError::RemoteDirInaccessible {
                    path: current,
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Uploads `local_root` into `remote_root`, creating remote directories
/// before their files. `strict` works as for [`download_tree`].
pub async fn upload_tree(
    ftp: &SharedFtp,
    local_root: &Path,
    remote_root: &str,
    strict: bool,
    sink: Arc<dyn ProgressSink>,
    cancel: &CancelToken,
) -> VaultResult<TreeCopy> {
    let remote_root = normalize_remote(remote_root);
    let listing = crate::walker::list_tree(local_root, cancel).await?;
    let unread = listing.unread_names();
    if strict {
        require_complete(&local_root.display().to_string(), &unread)?;
    }
    info!(
        "Uploading {} files ({} bytes) to {}",
        listing.files.len(),
        listing.total_bytes,
        remote_root
    );

    ensure_remote_dir(ftp, &remote_root).await?;
    for dir in &listing.dirs {
        cancel.check()?;
        ensure_remote_dir(ftp, &remote_child(&remote_root, dir)).await?;
    }

    let mut progress = TreeProgress::start(sink, listing.files.len(), listing.total_bytes);
    for file in listing.files {
        cancel.check()?;
        let remote = remote_child(&remote_root, &file.rel_path);
        let local = local_root.join(&file.rel_path);
        let sent = ftp.run(move |client| client.upload(&local, &remote)).await?;
        progress.file_done(file.rel_path.to_string_lossy().replace('\\', "/"), sent);
    }
    Ok(TreeCopy { bytes: progress.finish(), unread })
}

/// Deletes a remote tree. A directory that cannot be entered counts as already gone.
pub async fn delete_remote_tree(ftp: &SharedFtp, path: &str) -> VaultResult<()> {
    let path = normalize_remote(path);
    if path == "/" {
        return Err(VaultError::InvalidPath("refusing to delete the remote root".into()));
    }
    ftp.run(move |client| delete_blocking(client, &path)).await
}

fn delete_blocking(client: &mut dyn FtpClient, path: &str) -> VaultResult<()> {
    if client.cwd(path).is_err() {
        debug!("{} is already absent", path);
        return Ok(());
    }
    let entries = client.list(path)?;
    for entry in entries {
        let child = join_remote(path, &entry.name);
        if entry.is_dir() {
            delete_blocking(client, &child)?;
        } else {
            client.delete_file(&child)?;
        }
    }
    // leave the directory before removing it
    let _ = client.cwd(&remote_parent(path));
    client.remove_dir(path)
}

/// Whether a file or directory named like `path` exists in its parent.
pub async fn remote_exists(ftp: &SharedFtp, path: &str) -> VaultResult<bool> {
    let path = normalize_remote(path);
    let Some(name) = remote_basename(&path).map(str::to_string) else {
        return Ok(true);
    };
    let parent = remote_parent(&path);
    ftp.run(move |client| match client.list(&parent) {
        Ok(entries) => Ok(entries.iter().any(|e| e.name == name)),
        Err(_) => Ok(false),
    })
    .await
}

pub async fn rename_remote(ftp: &SharedFtp, from: &str, to: &str) -> VaultResult<()> {
    let from = normalize_remote(from);
    let to = normalize_remote(to);
    ftp.run(move |client| client.rename(&from, &to)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::address::FtpEndpoint;
    use crate::ftp::memory::{ListFault, MemoryServer};
    use crate::progress::{ProgressEvent, ProgressLog};
    use std::fs;

    fn connect(server: &MemoryServer) -> SharedFtp {
        SharedFtp::new(FtpEndpoint::parse("10.0.0.2", 2121), server.client())
    }

    #[tokio::test]
    async fn test_download_tree() {
        let server = MemoryServer::new();
        server.add_file("/games/X/sce_sys/param.json", b"{\"titleName\":\"X\"}".to_vec());
        server.add_file("/games/X/eboot.bin", vec![9u8; 4096]);
        server.add_dir("/games/X/empty");
        let ftp = connect(&server);
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new();

        let copied = download_tree(
            &ftp,
            "/games/X",
            &dir.path().join("X"),
            true,
            log.clone(),
            &CancelToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(copied.bytes, 4096 + 17);
        assert!(copied.is_complete());
        assert_eq!(fs::read(dir.path().join("X/eboot.bin")).unwrap(), vec![9u8; 4096]);
        assert!(dir.path().join("X/empty").is_dir());
        let completes = log
            .events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FileComplete { .. }))
            .count();
        assert_eq!(completes, 2);
    }

    #[tokio::test]
    async fn test_upload_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("X");
        fs::create_dir_all(src.join("sce_sys")).unwrap();
        fs::write(src.join("sce_sys/param.json"), b"{}").unwrap();
        fs::write(src.join("data.bin"), vec![1u8; 1024]).unwrap();

        let server = MemoryServer::new();
        server.add_dir("/mnt/ext1");
        let ftp = connect(&server);
        let copied = upload_tree(
            &ftp,
            &src,
            "/mnt/ext1/games/X",
            false,
            crate::progress::null_sink(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(copied.bytes, 1026);
        assert_eq!(server.read_file("/mnt/ext1/games/X/data.bin").unwrap().len(), 1024);
        assert!(server.exists("/mnt/ext1/games/X/sce_sys/param.json"));
    }

    #[tokio::test]
    async fn test_strict_download_refuses_partial_listing() {
        let server = MemoryServer::new();
        server.add_file("/games/X/eboot.bin", vec![1u8; 10]);
        server.add_file("/games/X/save/slot.dat", vec![2u8; 10]);
        server.queue_list_faults("/games/X/save", [ListFault::Fail, ListFault::Fail]);
        let ftp = connect(&server);
        let dir = tempfile::tempdir().unwrap();

        let err = download_tree(
            &ftp,
            "/games/X",
            &dir.path().join("strict"),
            true,
            crate::progress::null_sink(),
            &CancelToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VaultError::IncompleteSource { unread: 1, .. }));
        assert!(!dir.path().join("strict").exists());
        assert_eq!(server.download_count(), 0);

        let copied = download_tree(
            &ftp,
            "/games/X",
            &dir.path().join("loose"),
            false,
            crate::progress::null_sink(),
            &CancelToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(copied.unread, vec!["save".to_string()]);
        assert!(dir.path().join("loose/eboot.bin").exists());
        assert!(!dir.path().join("loose/save/slot.dat").exists());
    }

    #[tokio::test]
    async fn test_inaccessible_remote_dir() {
        let server = MemoryServer::new();
        server.add_dir("/mnt/usb0");
        server.make_read_only("/mnt/usb0");
        let ftp = connect(&server);
        let err = ensure_remote_dir(&ftp, "/mnt/usb0/games/X").await.unwrap_err();
        match err {
            VaultError::RemoteDirInaccessible { path, .. } => assert_eq!(path, "/mnt/usb0/games"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_remote_tree() {
        let server = MemoryServer::new();
        server.add_file("/games/X/a/b/c.bin", vec![0u8; 3]);
        server.add_file("/games/X/top.bin", vec![0u8; 3]);
        server.add_dir("/games/Keep");
        let ftp = connect(&server);
        delete_remote_tree(&ftp, "/games/X").await.unwrap();
        assert!(!server.exists("/games/X"));
        assert!(server.exists("/games/Keep"));
        // absent directory is not an error
        delete_remote_tree(&ftp, "/games/X").await.unwrap();
        assert!(delete_remote_tree(&ftp, "/").await.is_err());
    }

    #[tokio::test]
    async fn test_remote_exists_and_rename() {
        let server = MemoryServer::new();
        server.add_dir("/games/X");
        let ftp = connect(&server);
        assert!(remote_exists(&ftp, "/games/X").await.unwrap());
        assert!(!remote_exists(&ftp, "/games/Y").await.unwrap());
        assert!(!remote_exists(&ftp, "/nowhere/Y").await.unwrap());
        rename_remote(&ftp, "/games/X", "/games/Y").await.unwrap();
        assert!(remote_exists(&ftp, "/games/Y").await.unwrap());
    }
}
