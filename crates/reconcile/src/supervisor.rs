//! Watch supervisor: keeps the event subscription alive and feeds the
//! reconciler, one event at a time, in delivery order.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use natsync_store::FirewallStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::Reconciler;

/// Source of service change events. A subscription is a finite view of an
/// infinite sequence: the stream may end or error at any time, and a fresh
/// `subscribe` starts over with a full list of current services.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<natsync_core::ServiceEvent>>>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed wait between subscription attempts after a stream ends or errors.
    pub backoff: Duration,
    /// When set, the inner loop exits after this long even on a healthy
    /// stream, forcing a resubscribe whose initial list re-delivers every
    /// service. Closes the convergence gap where a failed write would
    /// otherwise wait for an event that never comes.
    pub resync: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { backoff: Duration::from_secs(5), resync: None }
    }
}

/// Outcome of one subscription's inner loop.
enum StreamExit {
    Ended,
    Errored,
    Resync,
    Shutdown,
}

/// Run the two-loop supervisor until `shutdown` flips to true.
///
/// Outer loop: (re-)establish the subscription, backing off on failure.
/// Inner loop: dispatch events serially; reconcile errors are logged and
/// contained, never fatal. Shutdown is checked at each loop boundary and
/// lets an in-flight reconcile finish.
pub async fn run<E, S>(
    source: &E,
    reconciler: &Reconciler<S>,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    E: EventSource,
    S: FirewallStore,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        match source.subscribe().await {
            Ok(stream) => {
                info!("event subscription established");
                match stream_events(stream, reconciler, &config, &mut shutdown).await {
                    StreamExit::Shutdown => break,
                    StreamExit::Ended => info!("event stream ended; resubscribing"),
                    StreamExit::Errored => warn!("event stream errored; resubscribing"),
                    StreamExit::Resync => info!("resync interval elapsed; resubscribing"),
                }
            }
            Err(e) => warn!(error = %e, "event subscription failed"),
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.backoff) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("supervisor stopped");
    Ok(())
}

async fn stream_events<S: FirewallStore>(
    mut stream: BoxStream<'static, Result<natsync_core::ServiceEvent>>,
    reconciler: &Reconciler<S>,
    config: &SupervisorConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamExit {
    let resync_at = config.resync.map(|d| tokio::time::Instant::now() + d);
    loop {
        let next = tokio::select! {
            biased;
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return StreamExit::Shutdown;
                }
                continue;
            }
            _ = resync_sleep(resync_at) => return StreamExit::Resync,
            next = stream.next() => next,
        };
        match next {
            None => return StreamExit::Ended,
            Some(Err(e)) => {
                warn!(error = %e, "transport error on event stream");
                return StreamExit::Errored;
            }
            Some(Ok(event)) => {
                if *shutdown.borrow() {
                    return StreamExit::Shutdown;
                }
                if !event.snapshot.is_load_balancer() {
                    debug!(service = %event.snapshot.id, kind = %event.snapshot.kind, "ignoring non-LoadBalancer service");
                    continue;
                }
                info!(service = %event.snapshot.id, change = ?event.kind, "event received");
                if let Err(e) = reconciler.reconcile(&event).await {
                    metrics::counter!("reconcile_err", 1u64);
                    error!(service = %event.snapshot.id, error = %e, "reconcile failed; continuing with next event");
                }
            }
        }
    }
}

async fn resync_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use natsync_core::{
        EventKind, Protocol, ServiceEvent, ServiceId, ServicePort, ServiceSnapshot,
        EXTERNAL_ADDRESS_ANNOTATION, OWNED_COLLECTION,
    };
    use natsync_store::MemoryStore;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn lb_event(name: &str, port: u16) -> ServiceEvent {
        ServiceEvent {
            kind: EventKind::Modified,
            snapshot: ServiceSnapshot {
                id: ServiceId::new("default", name),
                kind: "LoadBalancer".to_string(),
                ports: vec![ServicePort { port, protocol: Protocol::Tcp }],
                annotations: BTreeMap::from([(
                    EXTERNAL_ADDRESS_ANNOTATION.to_string(),
                    "20.1.2.3".to_string(),
                )]),
                ingress_address: Some("10.0.0.5".to_string()),
            },
        }
    }

    fn cluster_ip_event(name: &str) -> ServiceEvent {
        let mut ev = lb_event(name, 80);
        ev.snapshot.kind = "ClusterIP".to_string();
        ev
    }

    /// Plays one scripted batch per subscription, then hangs open.
    struct ScriptedSource {
        scripts: Mutex<Vec<Vec<Result<ServiceEvent>>>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Vec<Result<ServiceEvent>>>) -> Self {
            Self { scripts: Mutex::new(scripts) }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn subscribe(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>> {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Healthy but idle subscription.
                return Ok(stream::pending().boxed());
            }
            let batch = scripts.remove(0);
            Ok(stream::iter(batch).chain(stream::pending()).boxed())
        }
    }

    fn owned_rule_names(state: &natsync_core::RemoteFirewallState) -> Vec<String> {
        state
            .properties
            .nat_rule_collections
            .iter()
            .find(|c| c.name == OWNED_COLLECTION)
            .map(|c| {
                c.rules
                    .iter()
                    .filter_map(|r| r.get("name").and_then(Value::as_str))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn run_until_shutdown(source: ScriptedSource, reconciler: &Reconciler<MemoryStore>) {
        let (tx, rx) = watch::channel(false);
        let config = SupervisorConfig { backoff: Duration::from_millis(5), resync: None };
        tokio::join!(
            async {
                run(&source, reconciler, config, rx).await.unwrap();
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(true);
            }
        );
    }

    #[tokio::test]
    async fn dispatches_events_and_filters_non_load_balancers() {
        let source = ScriptedSource::new(vec![vec![
            Ok(cluster_ip_event("ignored")),
            Ok(lb_event("web", 80)),
        ]]);
        let reconciler = Reconciler::new(MemoryStore::new());
        run_until_shutdown(source, &reconciler).await;

        let state = reconciler.store().snapshot().await;
        assert_eq!(owned_rule_names(&state), vec!["default/web/80"]);
        assert_eq!(reconciler.store().write_count(), 1);
    }

    #[tokio::test]
    async fn resubscribes_after_mid_stream_transport_error() {
        let source = ScriptedSource::new(vec![
            vec![Ok(lb_event("web", 80)), Err(anyhow::anyhow!("connection reset"))],
            vec![Ok(lb_event("api", 443))],
        ]);
        let reconciler = Reconciler::new(MemoryStore::new());
        run_until_shutdown(source, &reconciler).await;

        let state = reconciler.store().snapshot().await;
        assert_eq!(owned_rule_names(&state), vec!["default/web/80", "default/api/443"]);
    }

    #[tokio::test]
    async fn subscription_failure_backs_off_and_retries() {
        struct FailOnce {
            inner: ScriptedSource,
            failed: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl EventSource for FailOnce {
            async fn subscribe(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>> {
                if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    anyhow::bail!("api server unreachable");
                }
                self.inner.subscribe().await
            }
        }

        let source = FailOnce {
            inner: ScriptedSource::new(vec![vec![Ok(lb_event("web", 80))]]),
            failed: std::sync::atomic::AtomicBool::new(false),
        };
        let reconciler = Reconciler::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let config = SupervisorConfig { backoff: Duration::from_millis(5), resync: None };
        tokio::join!(
            async {
                run(&source, &reconciler, config, rx).await.unwrap();
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(true);
            }
        );
        assert_eq!(owned_rule_names(&reconciler.store().snapshot().await), vec!["default/web/80"]);
    }

    #[tokio::test]
    async fn reconcile_errors_do_not_stop_the_inner_loop() {
        /// Fails the first read, then behaves like `MemoryStore`.
        struct FailFirstRead {
            inner: MemoryStore,
            failed: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl natsync_store::FirewallStore for FailFirstRead {
            async fn read(&self) -> Result<natsync_core::RemoteFirewallState> {
                if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    anyhow::bail!("remote unreachable");
                }
                self.inner.read().await
            }

            async fn write(&self, state: &natsync_core::RemoteFirewallState) -> Result<()> {
                self.inner.write(state).await
            }
        }

        let source = ScriptedSource::new(vec![vec![
            Ok(lb_event("doomed", 80)),
            Ok(lb_event("web", 80)),
        ]]);
        let store = FailFirstRead { inner: MemoryStore::new(), failed: std::sync::atomic::AtomicBool::new(false) };
        let reconciler = Reconciler::new(store);
        let (tx, rx) = watch::channel(false);
        let config = SupervisorConfig { backoff: Duration::from_millis(5), resync: None };
        tokio::join!(
            async {
                run(&source, &reconciler, config, rx).await.unwrap();
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(true);
            }
        );
        // The first reconcile failed, the loop moved on to the next event.
        let state = reconciler.store().inner.snapshot().await;
        assert_eq!(owned_rule_names(&state), vec!["default/web/80"]);
    }

    #[tokio::test]
    async fn shutdown_terminates_an_idle_supervisor() {
        let source = ScriptedSource::new(vec![]);
        let reconciler = Reconciler::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            run(&source, &reconciler, SupervisorConfig::default(), rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor honors shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn resync_forces_a_fresh_subscription() {
        // Two subscriptions, each delivering one service; without resync the
        // first stream would hang open and the second batch never plays.
        let source = ScriptedSource::new(vec![
            vec![Ok(lb_event("web", 80))],
            vec![Ok(lb_event("api", 443))],
        ]);
        let reconciler = Reconciler::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let config = SupervisorConfig {
            backoff: Duration::from_millis(5),
            resync: Some(Duration::from_millis(30)),
        };
        tokio::join!(
            async {
                run(&source, &reconciler, config, rx).await.unwrap();
            },
            async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = tx.send(true);
            }
        );
        let state = reconciler.store().snapshot().await;
        assert_eq!(owned_rule_names(&state), vec!["default/web/80", "default/api/443"]);
    }
}
