use crate::{
    core::{ConcurrencyLimit, InflightRegistry, ReleaseSlot},
    duration::parse_duration,
    grpc::{self, InflightMode, WaitConfig, WaitMetrics},
    index,
    listen::{self, Listener},
    PodDiscover,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{future::Future, net::SocketAddr, num::NonZeroUsize, path::PathBuf, pin::Pin, sync::Arc};
use tokio::time;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "pod-pacemaker-daemon",
    about = "Paces pod network setup on a node"
)]
pub struct Args {
    #[clap(long, default_value = "pacemaker=info,warn", env = "POD_PACEMAKER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The Unix socket on which the wait API is served.
    #[clap(long, default_value = "/run/pod-pacemaker/daemon.sock")]
    socket: PathBuf,

    /// Serves the wait API on a TCP address instead of `--socket`.
    #[clap(long)]
    grpc_addr: Option<SocketAddr>,

    /// The node whose pods are paced.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// The number of pods that may set up their network at once.
    #[clap(long, default_value = "4")]
    max_concurrent: NonZeroUsize,

    /// Releases a slot whose pod has not become ready within this time.
    #[clap(long, default_value = "5m", value_parser = parse_duration)]
    max_slot_hold: time::Duration,

    /// Never throttles pods owned by a DaemonSet.
    #[clap(long)]
    skip_daemonsets: bool,

    /// Never throttles pods whose controller has this kind.
    #[clap(long = "exempt-owner-kind")]
    exempt_owner_kinds: Vec<String>,

    /// How concurrent requests for the same pod are handled: `reject`,
    /// `queue`, or `disabled`.
    #[clap(long, default_value = "reject")]
    inflight: InflightMode,

    #[clap(long, default_value = "500ms", value_parser = parse_duration)]
    pod_poll_interval: time::Duration,

    /// Bounds requests that do not carry a deadline.
    #[clap(long, default_value = "120s", value_parser = parse_duration)]
    max_wait: time::Duration,

    /// How long in-flight requests may run after shutdown is signaled.
    #[clap(long, default_value = "30s", value_parser = parse_duration)]
    shutdown_grace: time::Duration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            socket,
            grpc_addr,
            node_name,
            max_concurrent,
            max_slot_hold,
            skip_daemonsets,
            exempt_owner_kinds,
            inflight,
            pod_poll_interval,
            max_wait,
            shutdown_grace,
        } = self;

        let config = WaitConfig {
            inflight,
            exempt_owner_kinds: exempt_kinds(skip_daemonsets, exempt_owner_kinds),
            pod_poll_interval,
            max_wait,
            ..WaitConfig::default()
        };

        let limit = ConcurrencyLimit::new(max_concurrent.get(), max_slot_hold);
        let releaser: Arc<dyn ReleaseSlot> = Arc::new(limit.clone());
        let pod_index = index::Index::shared(releaser);

        let mut prom = <Registry>::default();
        let reg = prom.sub_registry_with_prefix("pod_pacemaker");
        let metrics = WaitMetrics::register(reg);
        index::metrics::register(reg, pod_index.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Bind before watching so that a socket that cannot be served fails
        // startup.
        let listener = Listener::bind(&socket, grpc_addr).await?;

        let pods = runtime.watch_all::<Pod>(
            watcher::Config::default().fields(&format!("spec.nodeName={node_name}")),
        );
        tokio::spawn(
            kubert::index::namespaced(pod_index.clone(), pods).instrument(info_span!("pods")),
        );

        let server = grpc::WaitServer::new(
            PodDiscover::new(pod_index),
            limit,
            InflightRegistry::shared(),
            config,
            metrics,
        );
        tokio::spawn(grpc(
            listener,
            server,
            shutdown_grace,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn exempt_kinds(skip_daemonsets: bool, mut kinds: Vec<String>) -> Vec<String> {
    if skip_daemonsets && !kinds.iter().any(|k| k.eq_ignore_ascii_case("DaemonSet")) {
        kinds.push("DaemonSet".to_string());
    }
    kinds
}

type ServeFuture = Pin<Box<dyn Future<Output = Result<(), tonic::transport::Error>> + Send>>;

#[instrument(skip_all, fields(addr = %listener))]
async fn grpc(
    listener: Listener,
    server: grpc::WaitServer<PodDiscover, ConcurrencyLimit>,
    grace: time::Duration,
    drain: drain::Watch,
) -> Result<()> {
    let socket = listener.socket_path().map(PathBuf::from);

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let close = async move {
        let _ = close_rx.await;
    };
    let router = Server::builder().add_service(server.svc());
    let mut srv: ServeFuture = match listener {
        Listener::Unix { listener, .. } => Box::pin(
            router.serve_with_incoming_shutdown(UnixListenerStream::new(listener), close),
        ),
        Listener::Tcp(listener) => Box::pin(
            router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), close),
        ),
    };

    info!("Wait gRPC server listening");
    let res: Result<()> = tokio::select! {
        res = (&mut srv) => res.map_err(Into::into),
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            match handle.release_after(time::timeout(grace, srv)).await {
                Ok(res) => res.map_err(Into::into),
                Err(_) => {
                    warn!(?grace, "Requests did not complete before the shutdown grace period");
                    Ok(())
                }
            }
        }
    };

    if let Some(path) = socket {
        listen::cleanup(&path);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{PodContext, SlotPolicy},
        grpc::client,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubert::index::IndexNamespacedResource;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["pod-pacemaker-daemon", "--node-name=node-0"])
            .expect("arguments must parse");
        assert_eq!(args.socket, PathBuf::from("/run/pod-pacemaker/daemon.sock"));
        assert_eq!(args.grpc_addr, None);
        assert_eq!(args.node_name, "node-0");
        assert_eq!(args.max_concurrent.get(), 4);
        assert_eq!(args.inflight, InflightMode::Reject);
        assert_eq!(args.pod_poll_interval, time::Duration::from_millis(500));
        assert_eq!(args.max_wait, time::Duration::from_secs(120));
        assert_eq!(args.shutdown_grace, time::Duration::from_secs(30));
        assert!(!args.skip_daemonsets);
    }

    #[test]
    fn parses_overrides() {
        let args = Args::try_parse_from([
            "pod-pacemaker-daemon",
            "--node-name=node-0",
            "--grpc-addr=127.0.0.1:50051",
            "--max-concurrent=2",
            "--inflight=queue",
            "--max-slot-hold=90s",
            "--exempt-owner-kind=Job",
            "--exempt-owner-kind=StatefulSet",
            "--skip-daemonsets",
        ])
        .expect("arguments must parse");
        assert_eq!(args.grpc_addr, Some(([127, 0, 0, 1], 50051).into()));
        assert_eq!(args.max_concurrent.get(), 2);
        assert_eq!(args.inflight, InflightMode::Queue);
        assert_eq!(args.max_slot_hold, time::Duration::from_secs(90));
        assert_eq!(
            exempt_kinds(args.skip_daemonsets, args.exempt_owner_kinds),
            ["Job", "StatefulSet", "DaemonSet"]
        );
    }

    #[test]
    fn rejects_invalid_values() {
        for arg in [
            "--max-concurrent=0",
            "--inflight=sometimes",
            "--max-wait=10",
        ] {
            assert!(
                Args::try_parse_from(["pod-pacemaker-daemon", "--node-name=node-0", arg])
                    .is_err(),
                "{arg} must be rejected"
            );
        }
    }

    #[test]
    fn daemonsets_are_exempted_once() {
        assert!(exempt_kinds(false, vec![]).is_empty());
        assert_eq!(exempt_kinds(true, vec![]), ["DaemonSet"]);
        assert_eq!(exempt_kinds(true, vec!["daemonset".into()]), ["daemonset"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_lets_inflight_requests_finish() {
        let daemon = Daemon::spawn(time::Duration::from_secs(10)).await;
        let waiter = tokio::spawn(wait_for_slot(daemon.socket.clone()));
        daemon.wait_for_request("ns/pod-a").await;

        let drained = tokio::spawn(daemon.drain.drain());
        time::sleep(time::Duration::from_millis(100)).await;
        daemon.limit.release_slot("ns/holder");

        let res = time::timeout(time::Duration::from_secs(5), waiter)
            .await
            .expect("request must complete")
            .expect("request must not panic");
        assert!(res.is_ok(), "{res:?}");

        time::timeout(time::Duration::from_secs(5), drained)
            .await
            .expect("drain must complete")
            .expect("drain must not panic");
        time::timeout(time::Duration::from_secs(5), daemon.server)
            .await
            .expect("server must stop")
            .expect("server must not panic")
            .expect("server must stop cleanly");
        assert!(!daemon.socket.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_grace_bounds_inflight_requests() {
        let daemon = Daemon::spawn(time::Duration::from_millis(200)).await;
        let waiter = tokio::spawn(wait_for_slot(daemon.socket.clone()));
        daemon.wait_for_request("ns/pod-a").await;

        // The held slot is never released, so the request outlives the grace
        // period.
        let drained = tokio::spawn(daemon.drain.drain());
        time::timeout(time::Duration::from_secs(5), daemon.server)
            .await
            .expect("server must stop after the grace period")
            .expect("server must not panic")
            .expect("server must stop cleanly");
        time::timeout(time::Duration::from_secs(5), drained)
            .await
            .expect("drain must complete")
            .expect("drain must not panic");
        assert!(!daemon.socket.exists());

        waiter.abort();
    }

    /// A gRPC server whose only slot is held by another pod.
    struct Daemon {
        socket: PathBuf,
        limit: ConcurrencyLimit,
        inflight: Arc<InflightRegistry>,
        drain: drain::Signal,
        server: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    impl Daemon {
        async fn spawn(grace: time::Duration) -> Self {
            let dir = tempfile::tempdir().expect("must create temp dir");
            let socket = dir.path().join("daemon.sock");
            let listener = Listener::bind(&socket, None)
                .await
                .expect("socket must bind");

            let limit = ConcurrencyLimit::new(1, time::Duration::from_secs(300));
            limit
                .acquire_slot(
                    "ns/holder",
                    &PodContext::default(),
                    time::Instant::now() + time::Duration::from_secs(1),
                )
                .await
                .expect("slot must be granted");
            assert_eq!(limit.available(), 0);

            let pods = index::Index::shared(Arc::new(limit.clone()));
            pods.write().apply(Pod {
                metadata: ObjectMeta {
                    namespace: Some("ns".to_string()),
                    name: Some("pod-a".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });

            let inflight = InflightRegistry::shared();
            let server = grpc::WaitServer::new(
                PodDiscover::new(pods),
                limit.clone(),
                inflight.clone(),
                WaitConfig::default(),
                WaitMetrics::default(),
            );
            let (drain, watch) = drain::channel();
            let server = tokio::spawn(grpc(listener, server, grace, watch));

            Self {
                socket,
                limit,
                inflight,
                drain,
                server,
                _dir: dir,
            }
        }

        async fn wait_for_request(&self, key: &str) {
            time::timeout(time::Duration::from_secs(5), async {
                while !self.inflight.contains(key) {
                    time::sleep(time::Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("request must reach the server");
        }
    }

    async fn wait_for_slot(socket: PathBuf) -> Result<(), client::Error> {
        let config = client::Config::new(client::Target::Unix(socket));
        client::request_slot(
            time::Instant::now() + time::Duration::from_secs(10),
            "ns/pod-a",
            &config,
        )
        .await
    }
}
