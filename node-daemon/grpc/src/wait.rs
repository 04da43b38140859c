use crate::{
    api::{
        pod_limiter_server::{PodLimiter, PodLimiterServer},
        WaitRequest, WaitResponse,
    },
    metrics::WaitMetrics,
    timeout,
};
use pacemaker_daemon_core::{
    inflight::InflightGuard,
    poll::{poll_until, PollError},
    InflightRegistry, Outcome, PodContext, PodLookup, SlotDecision, SlotPolicy,
};
use std::{str::FromStr, sync::Arc};
use tokio::time;
use tracing::{debug, info_span, warn, Instrument};

/// How concurrent requests for the same slot are handled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum InflightMode {
    /// A second request for a key that is being processed is denied.
    #[default]
    Reject,

    /// A second request waits for the first to finish.
    Queue,

    /// Requests are not deduplicated.
    Disabled,
}

#[derive(Clone, Debug)]
pub struct WaitConfig {
    pub inflight: InflightMode,

    /// Owner kinds (e.g. `DaemonSet`) whose pods are never throttled.
    pub exempt_owner_kinds: Vec<String>,

    pub pod_poll_interval: time::Duration,

    /// Bounds requests that do not carry a deadline of their own.
    pub max_wait: time::Duration,

    /// Subtracted from the caller's deadline so that a denial reaches the
    /// caller before its own deadline fires.
    pub reply_margin: time::Duration,
}

pub struct WaitServer<L, P> {
    lookup: Arc<L>,
    policy: Arc<P>,
    inflight: Arc<InflightRegistry>,
    config: Arc<WaitConfig>,
    metrics: WaitMetrics,
}

// === impl InflightMode ===

impl FromStr for InflightMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            "disabled" => Ok(Self::Disabled),
            s => anyhow::bail!(
                "invalid inflight mode {s:?} (expected one of 'reject', 'queue', or 'disabled')"
            ),
        }
    }
}

// === impl WaitConfig ===

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            inflight: InflightMode::default(),
            exempt_owner_kinds: Vec::new(),
            pod_poll_interval: time::Duration::from_millis(500),
            max_wait: time::Duration::from_secs(120),
            reply_margin: time::Duration::from_millis(250),
        }
    }
}

// === impl WaitServer ===

impl<L, P> Clone for WaitServer<L, P> {
    fn clone(&self) -> Self {
        Self {
            lookup: self.lookup.clone(),
            policy: self.policy.clone(),
            inflight: self.inflight.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<L, P> WaitServer<L, P>
where
    L: PodLookup,
    P: SlotPolicy,
{
    pub fn new(
        lookup: L,
        policy: P,
        inflight: Arc<InflightRegistry>,
        config: WaitConfig,
        metrics: WaitMetrics,
    ) -> Self {
        Self {
            lookup: Arc::new(lookup),
            policy: Arc::new(policy),
            inflight,
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn svc(self) -> PodLimiterServer<Self> {
        PodLimiterServer::new(self)
    }

    /// Runs a single request to completion.
    ///
    /// Every blocking step is bounded by `deadline`. If this future is dropped
    /// early, the inflight entry is still released.
    pub async fn decide(&self, key: &str, deadline: time::Instant) -> SlotDecision {
        let observer = self.metrics.start();

        let outcome = self.outcome(key, deadline).await;

        observer.end(&outcome);
        let decision = outcome.decision(key);
        debug!(
            granted = decision.granted,
            message = %decision.message,
            elapsed = ?observer.elapsed(),
            "Decided"
        );
        decision
    }

    async fn outcome(&self, key: &str, deadline: time::Instant) -> Outcome {
        let _guard = match self.claim(key, deadline).await {
            Ok(guard) => guard,
            Err(outcome) => return outcome,
        };

        let pod = match self.resolve_pod(key, deadline).await {
            Some(pod) => pod,
            None => {
                warn!("Failed to get pod");
                return Outcome::PodNotFound;
            }
        };

        if let Some(kind) = pod.exempt_kind(&self.config.exempt_owner_kinds) {
            debug!(%kind, "Skipping exempt pod");
            return Outcome::Exempt {
                kind: kind.to_string(),
            };
        }

        match time::timeout_at(deadline, self.policy.acquire_slot(key, &pod, deadline)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(%error, "Failed to acquire slot");
                return Outcome::PolicyTimeout;
            }
            Err(_) => {
                debug!("Timed out acquiring slot");
                return Outcome::PolicyTimeout;
            }
        }

        // The slot may have been granted just as the deadline passed, in which
        // case the caller has already given up.
        if time::Instant::now() >= deadline {
            debug!("Deadline passed while acquiring slot");
            return Outcome::Cancelled;
        }

        Outcome::Granted
    }

    async fn claim(
        &self,
        key: &str,
        deadline: time::Instant,
    ) -> Result<Option<InflightGuard>, Outcome> {
        match self.config.inflight {
            InflightMode::Disabled => Ok(None),
            InflightMode::Reject => match self.inflight.claim(key) {
                Ok(guard) => Ok(Some(guard)),
                Err(_) => {
                    debug!("Slot already awaited");
                    Err(Outcome::AlreadyAwaited)
                }
            },
            InflightMode::Queue => time::timeout_at(deadline, self.inflight.claim_queued(key))
                .await
                .map(Some)
                .map_err(|_| {
                    debug!("Deadline passed while queued behind another request");
                    Outcome::Cancelled
                }),
        }
    }

    /// Polls the pod lookup until the pod is observed or `deadline` passes.
    ///
    /// Pods are frequently not yet visible to the cache when their network is
    /// set up, so a miss is a reason to wait rather than to fail.
    async fn resolve_pod(&self, key: &str, deadline: time::Instant) -> Option<PodContext> {
        let res = poll_until(self.config.pod_poll_interval, deadline, || {
            let found = match self.lookup.get_pod_by_key(key) {
                Ok(Some(pod)) => Some(pod),
                Ok(None) => {
                    self.metrics.pod_not_found();
                    None
                }
                Err(error) => {
                    debug!(%error, "Pod lookup failed");
                    self.metrics.pod_not_found();
                    None
                }
            };
            std::future::ready(Ok::<_, std::convert::Infallible>(found))
        })
        .await;
        match res {
            Ok(pod) => Some(pod),
            Err(PollError::Elapsed) => None,
            Err(PollError::Aborted(never)) => match never {},
        }
    }

    fn deadline(&self, metadata: &tonic::metadata::MetadataMap) -> time::Instant {
        let now = time::Instant::now();
        let max = now + self.config.max_wait;
        match timeout::from_metadata(metadata) {
            Some(Ok(timeout)) => {
                let deadline = now + timeout.saturating_sub(self.config.reply_margin);
                deadline.min(max)
            }
            Some(Err(error)) => {
                debug!(%error, "Ignoring request deadline");
                max
            }
            None => max,
        }
    }
}

#[async_trait::async_trait]
impl<L, P> PodLimiter for WaitServer<L, P>
where
    L: PodLookup,
    P: SlotPolicy,
{
    async fn wait(
        &self,
        req: tonic::Request<WaitRequest>,
    ) -> Result<tonic::Response<WaitResponse>, tonic::Status> {
        let deadline = self.deadline(req.metadata());
        let WaitRequest { slot_name } = req.into_inner();
        if slot_name.is_empty() {
            return Err(tonic::Status::invalid_argument("slot name must be set"));
        }

        let SlotDecision { granted, message } = self
            .decide(&slot_name, deadline)
            .instrument(info_span!("wait", slot = %slot_name))
            .await;
        Ok(tonic::Response::new(WaitResponse {
            success: granted,
            message,
        }))
    }
}
