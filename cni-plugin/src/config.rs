//! The plugin's network configuration, read from stdin.

use pacemaker_daemon_grpc::client::{self, Target, TransientErrors};
use serde::Deserialize;
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

const DEFAULT_MAX_WAIT_SECS: u64 = 120;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,

    /// The result of the previous plugin in the chain.
    #[serde(default)]
    pub prev_result: Option<serde_json::Value>,

    #[serde(default)]
    pub daemon_socket_path: Option<PathBuf>,

    /// Connects to the daemon on the loopback interface instead of a socket.
    #[serde(default)]
    pub daemon_port: Option<u16>,

    #[serde(default)]
    pub max_wait_time_in_seconds: Option<u64>,

    #[serde(default)]
    pub success_on_connection_timeout: bool,

    /// Overrides the error messages that are treated as a broken connection.
    #[serde(default)]
    pub transient_errors: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse network configuration: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("daemonSocketPath or daemonPort must be set")]
    NoDaemon,

    #[error("daemonPort must not be 0")]
    InvalidPort,

    #[error("must be called as chained plugin")]
    NotChained,

    #[error("failed to convert prevResult: expected an object")]
    InvalidPrevResult,
}

// === impl NetConf ===

impl NetConf {
    pub fn parse(stdin: &[u8]) -> Result<Self, Error> {
        let conf = serde_json::from_slice::<Self>(stdin)?;
        conf.target()?;
        Ok(conf)
    }

    pub fn target(&self) -> Result<Target, Error> {
        match (&self.daemon_socket_path, self.daemon_port) {
            (Some(path), _) if !path.as_os_str().is_empty() => Ok(Target::Unix(path.clone())),
            (_, Some(0)) => Err(Error::InvalidPort),
            (_, Some(port)) => Ok(Target::Tcp((Ipv4Addr::LOCALHOST, port).into())),
            _ => Err(Error::NoDaemon),
        }
    }

    pub fn max_wait(&self) -> Duration {
        match self.max_wait_time_in_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
        }
    }

    pub fn client_config(&self) -> Result<client::Config, Error> {
        let mut config = client::Config::new(self.target()?);
        config.fail_open_on_connect_timeout = self.success_on_connection_timeout;
        if let Some(signatures) = &self.transient_errors {
            config.transient = TransientErrors::signatures(signatures);
        }
        Ok(config)
    }

    /// Returns the previous plugin's result, tagged with this configuration's
    /// version, to be passed along the chain.
    pub fn chained_result(&self) -> Result<serde_json::Value, Error> {
        let mut result = self.prev_result.clone().ok_or(Error::NotChained)?;
        let obj = result.as_object_mut().ok_or(Error::InvalidPrevResult)?;
        obj.insert(
            "cniVersion".to_string(),
            serde_json::Value::String(self.cni_version.clone()),
        );
        Ok(result)
    }
}
