//! [`FtpClient`] over a real control connection (`ftp` crate).

use ftp::types::FileType;
use ftp::{FtpError, FtpStream};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

use super::address::FtpEndpoint;
use super::listing::{parse_listing, RemoteEntry};
use super::{FtpClient, FtpConnector};
use crate::errors::{VaultError, VaultResult};

fn ftp_err(what: &str, path: &str, err: FtpError) -> VaultError {
    VaultError::Ftp(format!("{what} {path}: {err}"))
}

pub struct NativeFtp {
    stream: FtpStream,
}

impl FtpClient for NativeFtp {
    fn list(&mut self, path: &str) -> VaultResult<Vec<RemoteEntry>> {
        let lines = self
            .stream
            .list(Some(path))
            .map_err(|e| ftp_err("LIST", path, e))?;
        Ok(parse_listing(&lines))
    }

    fn cwd(&mut self, path: &str) -> VaultResult<()> {
        self.stream.cwd(path).map_err(|e| ftp_err("CWD", path, e))
    }

    fn mkdir(&mut self, path: &str) -> VaultResult<()> {
        self.stream.mkdir(path).map_err(|e| ftp_err("MKD", path, e))
    }

    fn download(&mut self, remote: &str, local: &Path) -> VaultResult<u64> {
        let bytes = self
            .stream
            .retr(remote, |reader| {
                let file = File::create(local).map_err(FtpError::ConnectionError)?;
                let mut writer = BufWriter::new(file);
                let copied = io::copy(reader, &mut writer).map_err(FtpError::ConnectionError)?;
                writer.flush().map_err(FtpError::ConnectionError)?;
                Ok(copied)
            })
            .map_err(|e| ftp_err("RETR", remote, e))?;
        Ok(bytes)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> VaultResult<u64> {
        let file = File::open(local)?;
        let size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        self.stream
            .put(remote, &mut reader)
            .map_err(|e| ftp_err("STOR", remote, e))?;
        Ok(size)
    }

    fn delete_file(&mut self, path: &str) -> VaultResult<()> {
        self.stream.rm(path).map_err(|e| ftp_err("DELE", path, e))
    }

    fn remove_dir(&mut self, path: &str) -> VaultResult<()> {
        self.stream.rmdir(path).map_err(|e| ftp_err("RMD", path, e))
    }

    fn rename(&mut self, from: &str, to: &str) -> VaultResult<()> {
        self.stream
            .rename(from, to)
            .map_err(|e| ftp_err("RNFR/RNTO", from, e))
    }

    fn quit(&mut self) {
        if let Err(e) = self.stream.quit() {
            debug!("QUIT failed: {}", e);
        }
    }
}

/// Opens binary-mode sessions with the endpoint's credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConnector;

impl FtpConnector for NativeConnector {
    fn connect(&self, endpoint: &FtpEndpoint) -> VaultResult<Box<dyn FtpClient>> {
        let connect_err = |message: String| VaultError::FtpConnect {
            endpoint: endpoint.to_string(),
            message,
        };
        let mut stream =
            FtpStream::connect(endpoint.socket_addr()).map_err(|e| connect_err(e.to_string()))?;
        stream
            .login(&endpoint.user, &endpoint.password)
            .map_err(|e| connect_err(format!("login failed: {e}")))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| connect_err(format!("cannot switch to binary mode: {e}")))?;
        debug!("Logged in to {}", endpoint);
        Ok(Box::new(NativeFtp { stream }))
    }
}
