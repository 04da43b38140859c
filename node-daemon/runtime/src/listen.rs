use anyhow::{Context, Result};
use std::{
    fmt,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, warn};

/// A bound gRPC listener.
#[derive(Debug)]
pub(crate) enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Binds a TCP listener if `addr` is set and otherwise a Unix socket at
    /// `socket`, replacing any socket left behind by a previous process.
    pub(crate) async fn bind(socket: &Path, addr: Option<SocketAddr>) -> Result<Self> {
        if let Some(addr) = addr {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            return Ok(Self::Tcp(listener));
        }

        if let Some(parent) = socket.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        remove_socket(socket)?;

        let listener = UnixListener::bind(socket)
            .with_context(|| format!("failed to bind {}", socket.display()))?;
        Ok(Self::Unix {
            listener,
            path: socket.to_path_buf(),
        })
    }

    pub(crate) fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix { path, .. } => Some(path),
            Self::Tcp(_) => None,
        }
    }
}

/// Removes the socket once the server has stopped.
pub(crate) fn cleanup(path: &Path) {
    if let Err(error) = remove_socket(path) {
        warn!(%error, "Failed to remove socket");
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path, .. } => write!(f, "unix://{}", path.display()),
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "{addr}"),
                Err(_) => write!(f, "tcp"),
            },
        }
    }
}

fn remove_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}
