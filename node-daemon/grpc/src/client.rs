//! Requests a slot from the node daemon.
//!
//! The daemon may be restarting or not yet running when a pod's network is set
//! up, so connection failures are retried until the caller's deadline. Once
//! connected, a single `Wait` call is issued; it is only re-issued (on a new
//! connection) if it fails with a transient connection error.

use crate::api::{pod_limiter_client::PodLimiterClient, WaitRequest, WaitResponse};
use pacemaker_daemon_core::poll::{poll_until, PollError};
use std::{fmt, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

pub use tonic::Status;

/// Where the daemon listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub target: Target,

    /// How long to wait between connection attempts.
    pub retry_interval: time::Duration,

    /// Treat a daemon that cannot be reached before the deadline as having
    /// granted the slot.
    pub fail_open_on_connect_timeout: bool,

    pub transient: TransientErrors,
}

/// Decides which RPC failures indicate a broken connection that is worth
/// reconnecting for.
#[derive(Clone)]
pub struct TransientErrors(Arc<dyn Fn(&tonic::Status) -> bool + Send + Sync>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out connecting to the daemon at {0}")]
    ConnectTimeout(Target),

    #[error("timed out waiting for a slot")]
    DeadlineExceeded,

    #[error("failed to acquire slot: {0}")]
    Rejected(String),

    #[error("wait request failed: {0}")]
    Rpc(#[source] tonic::Status),
}

/// Requests the slot `slot_name`, returning once it is granted.
pub async fn request_slot(
    deadline: time::Instant,
    slot_name: &str,
    config: &Config,
) -> Result<(), Error> {
    loop {
        let channel = match connect(&config.target, config.retry_interval, deadline).await {
            Ok(channel) => channel,
            Err(error) if config.fail_open_on_connect_timeout => {
                warn!(%error, "Failed to connect to daemon; proceeding without a slot");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let mut client = PodLimiterClient::new(channel);
        let mut req = tonic::Request::new(WaitRequest {
            slot_name: slot_name.to_string(),
        });
        req.set_timeout(deadline.saturating_duration_since(time::Instant::now()));

        let status = match time::timeout_at(deadline, client.wait(req)).await {
            Err(_) => return Err(Error::DeadlineExceeded),
            Ok(Ok(rsp)) => {
                let WaitResponse { success, message } = rsp.into_inner();
                if !success {
                    return Err(Error::Rejected(message));
                }
                debug!(%message, "Slot granted");
                return Ok(());
            }
            Ok(Err(status)) => status,
        };

        retryable(status, deadline, &config.transient)?;
        if time::timeout_at(deadline, time::sleep(config.retry_interval))
            .await
            .is_err()
        {
            return Err(Error::DeadlineExceeded);
        }
    }
}

/// Decides whether a failed `Wait` call should be re-issued on a new
/// connection.
fn retryable(
    status: tonic::Status,
    deadline: time::Instant,
    transient: &TransientErrors,
) -> Result<(), Error> {
    match status.code() {
        // The daemon gave up on our behalf.
        tonic::Code::DeadlineExceeded => Err(Error::DeadlineExceeded),
        tonic::Code::Cancelled if time::Instant::now() >= deadline => {
            Err(Error::DeadlineExceeded)
        }
        // A daemon torn down mid-request resets its streams.
        _ if transient.is_transient(&status) => {
            warn!(%status, "Lost connection to daemon; retrying");
            Ok(())
        }
        _ => Err(Error::Rpc(status)),
    }
}

/// Dials `target` every `interval` until a connection is established.
async fn connect(
    target: &Target,
    interval: time::Duration,
    deadline: time::Instant,
) -> Result<Channel, Error> {
    let res = poll_until(interval, deadline, move || async move {
        match target.connect().await {
            Ok(channel) => Ok::<_, std::convert::Infallible>(Some(channel)),
            Err(error) => {
                warn!(%target, error = %ErrorChain(&error), "Failed to connect to daemon");
                Ok(None)
            }
        }
    })
    .await;
    match res {
        Ok(channel) => Ok(channel),
        Err(PollError::Elapsed) => Err(Error::ConnectTimeout(target.clone())),
        Err(PollError::Aborted(never)) => match never {},
    }
}

// === impl Target ===

impl Target {
    async fn connect(&self) -> Result<Channel, tonic::transport::Error> {
        match self {
            Self::Tcp(addr) => Endpoint::from_shared(format!("http://{addr}"))?
                .connect()
                .await,
            Self::Unix(path) => {
                let path = path.clone();
                // The URI is required by the endpoint but unused by the connector.
                Endpoint::from_static("http://localhost")
                    .connect_with_connector(tower::service_fn(move |_: http::Uri| {
                        let path = path.clone();
                        async move {
                            let stream = tokio::net::UnixStream::connect(path).await?;
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
                        }
                    }))
                    .await
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

// === impl Config ===

impl Config {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            retry_interval: time::Duration::from_secs(1),
            fail_open_on_connect_timeout: false,
            transient: TransientErrors::default(),
        }
    }
}

// === impl TransientErrors ===

impl TransientErrors {
    /// Error messages that indicate the connection to the daemon broke.
    pub const DEFAULT_SIGNATURES: &'static [&'static str] = &[
        "connection refused",
        "connection reset",
        "connection closed",
        "broken pipe",
        "socket closed",
        "transport is closing",
        "transport error",
        "error reading from server",
        "error while dialing",
        "error trying to connect",
    ];

    /// Matches failures whose message (or any of its sources) contains one of
    /// `signatures`, ignoring case.
    pub fn signatures<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let signatures = signatures
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .collect::<Vec<_>>();
        Self::from_fn(move |status| {
            let msg = ErrorChain(status).to_string().to_ascii_lowercase();
            signatures.iter().any(|s| msg.contains(s.as_str()))
        })
    }

    pub fn from_fn(f: impl Fn(&tonic::Status) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn is_transient(&self, status: &tonic::Status) -> bool {
        (self.0)(status)
    }
}

impl Default for TransientErrors {
    fn default() -> Self {
        Self::signatures(Self::DEFAULT_SIGNATURES)
    }
}

impl fmt::Debug for TransientErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransientErrors").finish_non_exhaustive()
    }
}

/// Formats an error along with all of its sources.
struct ErrorChain<'e, E>(&'e E);

impl<E: std::error::Error> fmt::Display for ErrorChain<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_signatures() {
        let transient = TransientErrors::default();
        assert!(transient.is_transient(&tonic::Status::unavailable(
            "error trying to connect: Connection refused (os error 111)"
        )));
        assert!(transient.is_transient(&tonic::Status::unknown(
            "h2 protocol error: Connection reset by peer"
        )));
        assert!(!transient.is_transient(&tonic::Status::invalid_argument(
            "slot name must be set"
        )));
    }

    #[test]
    fn custom_signatures() {
        let transient = TransientErrors::signatures(["GOAWAY"]);
        assert!(transient.is_transient(&tonic::Status::unavailable("received goaway")));
        assert!(!transient.is_transient(&tonic::Status::unavailable("connection refused")));

        let unavailable = TransientErrors::from_fn(|s| s.code() == tonic::Code::Unavailable);
        assert!(unavailable.is_transient(&tonic::Status::unavailable("anything")));
    }

    #[test]
    fn cancelled_before_deadline_is_retried() {
        let transient = TransientErrors::default();
        let deadline = time::Instant::now() + time::Duration::from_secs(60);

        assert!(retryable(
            tonic::Status::cancelled("operation was canceled: connection closed"),
            deadline,
            &transient,
        )
        .is_ok());
        assert!(matches!(
            retryable(tonic::Status::cancelled("canceled"), deadline, &transient),
            Err(Error::Rpc(s)) if s.code() == tonic::Code::Cancelled
        ));
        assert!(matches!(
            retryable(
                tonic::Status::deadline_exceeded("timeout expired"),
                deadline,
                &transient,
            ),
            Err(Error::DeadlineExceeded)
        ));
    }

    #[test]
    fn cancelled_after_deadline_is_a_timeout() {
        let transient = TransientErrors::default();
        let deadline = time::Instant::now();

        assert!(matches!(
            retryable(
                tonic::Status::cancelled("operation was canceled: connection closed"),
                deadline,
                &transient,
            ),
            Err(Error::DeadlineExceeded)
        ));
    }

    #[test]
    fn target_display() {
        assert_eq!(
            Target::Unix("/run/pod-pacemaker/daemon.sock".into()).to_string(),
            "unix:///run/pod-pacemaker/daemon.sock"
        );
        assert_eq!(
            Target::Tcp(([127, 0, 0, 1], 50051).into()).to_string(),
            "127.0.0.1:50051"
        );
    }
}
