//! IPv4 forwarding control via `/proc/sys/net/ipv4/ip_forward`.

use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::error::SystemError;
use crate::system::SystemResult;

pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Reads and writes the IPv4 forwarding knob.
#[derive(Debug, Clone)]
pub struct IpForwarding {
    path: PathBuf,
}

impl IpForwarding {
    pub fn new() -> Self {
        Self::with_path(IP_FORWARD_PATH)
    }

    /// Use a different knob file. Lets tests point at a temp file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the current IP forwarding state.
    pub async fn get_state(&self) -> SystemResult<bool> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.map_io_error(e))?;

        match contents.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(SystemError::UnsupportedPlatform(format!(
                "unexpected value {:?} in {}",
                other,
                self.path.display()
            ))),
        }
    }

    pub async fn set_state(&self, enabled: bool) -> SystemResult<()> {
        // procfs knobs exist ahead of time; never create one.
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| self.map_io_error(e))?;
        if !exists {
            return Err(self.missing());
        }

        let value = if enabled { "1\n" } else { "0\n" };
        debug!(path = %self.path.display(), value = value.trim(), "writing forwarding knob");

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| self.map_io_error(e))?;

        tokio::io::AsyncWriteExt::write_all(&mut file, value.as_bytes())
            .await
            .map_err(|e| self.map_io_error(e))?;

        Ok(())
    }

    fn missing(&self) -> SystemError {
        SystemError::UnsupportedPlatform(format!(
            "IPv4 forwarding control {} not present",
            self.path.display()
        ))
    }

    fn map_io_error(&self, err: io::Error) -> SystemError {
        match err.kind() {
            io::ErrorKind::NotFound => self.missing(),
            io::ErrorKind::PermissionDenied => SystemError::PermissionDenied,
            // /proc/sys is mounted read-only inside unprivileged containers.
            _ if err.raw_os_error() == Some(libc::EROFS) => SystemError::PermissionDenied,
            _ => SystemError::Io(err),
        }
    }
}
