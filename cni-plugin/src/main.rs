//! A chained CNI plugin that holds a pod's network setup until the node
//! daemon grants it a slot.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cni_args;
mod config;

use self::config::NetConf;
use pacemaker_daemon_grpc::client;
use serde_json::{json, Value};
use std::io::{self, Read, Write};
use tokio::time;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "POD_PACEMAKER_CNI_LOG";

const CNI_VERSION: &str = "1.0.0";

const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("CNI_COMMAND must be set")]
    MissingCommand,

    #[error("unknown CNI_COMMAND {0:?}")]
    UnknownCommand(String),

    #[error("failed to read network configuration: {0}")]
    Stdin(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Args(#[from] cni_args::MissingArg),

    #[error(transparent)]
    Wait(#[from] client::Error),

    #[error("not implemented")]
    NotImplemented,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_log();

    let command = std::env::var("CNI_COMMAND").ok();
    let cni_args = std::env::var("CNI_ARGS").unwrap_or_default();

    let mut stdin = Vec::new();
    let res = match command.as_deref() {
        // The network configuration is irrelevant to these.
        None | Some("VERSION") => Ok(()),
        Some(_) => io::stdin()
            .read_to_end(&mut stdin)
            .map(|_| ())
            .map_err(Error::Stdin),
    };

    let res = match res {
        Ok(()) => run(command.as_deref(), &cni_args, &stdin).await,
        Err(error) => Err(error),
    };

    match res {
        Ok(Some(output)) => {
            if let Err(error) = print(&output) {
                tracing::error!(%error, "Failed to write result");
                std::process::exit(1);
            }
        }
        Ok(None) => {}
        Err(error) => {
            tracing::error!(%error, code = error.code(), "Failed");
            let _ = print(&error.to_json(&stdin));
            std::process::exit(1);
        }
    }
}

/// Executes a CNI command, returning the document to print on success.
async fn run(command: Option<&str>, cni_args: &str, stdin: &[u8]) -> Result<Option<Value>, Error> {
    match command {
        Some("ADD") => add(cni_args, stdin).await.map(Some),
        Some("DEL") => {
            debug!("Nothing to clean up");
            Ok(None)
        }
        Some("CHECK") => Err(Error::NotImplemented),
        Some("VERSION") => Ok(Some(json!({
            "cniVersion": CNI_VERSION,
            "supportedVersions": SUPPORTED_VERSIONS,
        }))),
        Some(cmd) => Err(Error::UnknownCommand(cmd.to_string())),
        None => Err(Error::MissingCommand),
    }
}

async fn add(cni_args: &str, stdin: &[u8]) -> Result<Value, Error> {
    let conf = NetConf::parse(stdin)?;
    let result = conf.chained_result()?;
    let slot_name = cni_args::slot_name(cni_args)?;
    let config = conf.client_config()?;

    let max_wait = conf.max_wait();
    info!(slot = %slot_name, daemon = %config.target, ?max_wait, "Waiting for slot");
    client::request_slot(time::Instant::now() + max_wait, &slot_name, &config).await?;
    info!(slot = %slot_name, "Slot acquired");

    Ok(result)
}

fn init_log() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Stdout is reserved for results.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn print(output: &Value) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, output)?;
    writeln!(stdout)
}

// === impl Error ===

impl Error {
    /// The CNI error code for this failure.
    fn code(&self) -> u32 {
        match self {
            Self::MissingCommand | Self::UnknownCommand(_) | Self::Args(_) => 4,
            Self::Stdin(_) => 5,
            Self::Config(config::Error::Decode(_)) => 6,
            Self::Config(_) => 7,
            Self::Wait(_) => 11,
            Self::NotImplemented => 100,
        }
    }

    fn to_json(&self, stdin: &[u8]) -> Value {
        let version = serde_json::from_slice::<Value>(stdin)
            .ok()
            .and_then(|conf| Some(conf.get("cniVersion")?.as_str()?.to_string()))
            .unwrap_or_else(|| CNI_VERSION.to_string());
        json!({
            "cniVersion": version,
            "code": self.code(),
            "msg": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_ARGS: &str = "IgnoreUnknown=1;K8S_POD_NAMESPACE=ns;K8S_POD_NAME=pod-a";

    #[tokio::test]
    async fn version() {
        let output = run(Some("VERSION"), "", b"").await.unwrap().unwrap();
        assert_eq!(output["cniVersion"], "1.0.0");
        assert!(output["supportedVersions"]
            .as_array()
            .unwrap()
            .contains(&json!("0.4.0")));
    }

    #[tokio::test]
    async fn del_and_check() {
        assert!(run(Some("DEL"), POD_ARGS, b"{}").await.unwrap().is_none());

        let error = run(Some("CHECK"), POD_ARGS, b"{}").await.unwrap_err();
        assert_eq!(error.code(), 100);
        assert_eq!(error.to_string(), "not implemented");
    }

    #[tokio::test]
    async fn invalid_command() {
        assert_eq!(run(None, "", b"").await.unwrap_err().code(), 4);
        assert_eq!(run(Some("GC"), "", b"").await.unwrap_err().code(), 4);
    }

    #[tokio::test]
    async fn add_requires_chaining() {
        let conf = json!({ "cniVersion": "0.4.0", "daemonPort": 50051 });
        let error = run(Some("ADD"), POD_ARGS, conf.to_string().as_bytes())
            .await
            .unwrap_err();
        assert_eq!(error.code(), 7);
        assert_eq!(
            error.to_json(conf.to_string().as_bytes()),
            json!({
                "cniVersion": "0.4.0",
                "code": 7,
                "msg": "must be called as chained plugin",
            })
        );
    }

    #[tokio::test]
    async fn add_requires_pod() {
        let conf = chained_conf("/nonexistent/daemon.sock", false);
        let error = run(Some("ADD"), "K8S_POD_NAME=pod-a", &conf)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 4);
        assert_eq!(error.to_string(), "K8S_POD_NAMESPACE not found in CNI_ARGS");
    }

    #[tokio::test]
    async fn add_fails_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let conf = chained_conf(socket.to_str().unwrap(), false);

        let error = run(Some("ADD"), POD_ARGS, &conf).await.unwrap_err();
        assert!(
            matches!(error, Error::Wait(client::Error::ConnectTimeout(_))),
            "{error:?}"
        );
        assert_eq!(error.code(), 11);
    }

    #[tokio::test]
    async fn add_fails_open_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let conf = chained_conf(socket.to_str().unwrap(), true);

        let output = run(Some("ADD"), POD_ARGS, &conf).await.unwrap().unwrap();
        assert_eq!(
            output,
            json!({
                "cniVersion": "1.0.0",
                "interfaces": [{ "name": "eth0" }],
            })
        );
    }

    fn chained_conf(socket: &str, fail_open: bool) -> Vec<u8> {
        json!({
            "cniVersion": "1.0.0",
            "name": "k8s-pod-network",
            "type": "pod-pacemaker",
            "daemonSocketPath": socket,
            "maxWaitTimeInSeconds": 1,
            "successOnConnectionTimeout": fail_open,
            "prevResult": {
                "cniVersion": "1.0.0",
                "interfaces": [{ "name": "eth0" }],
            },
        })
        .to_string()
        .into_bytes()
    }
}
