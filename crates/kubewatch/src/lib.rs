//! Natsync kube integration – the Service watcher as an [`EventSource`].

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use natsync_core::{EventKind, Protocol, ServiceEvent, ServiceId, ServicePort, ServiceSnapshot};
use natsync_reconcile::EventSource;
use tracing::{debug, info, warn};

/// Cluster-wide Service event source backed by a kube watcher.
pub struct KubeServices {
    client: Client,
}

impl KubeServices {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the ambient kubeconfig / in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl EventSource for KubeServices {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>> {
        let api: Api<Service> = Api::all(self.client.clone());
        info!("service watcher starting (all namespaces)");
        let stream = watcher::watcher(api, watcher::Config::default())
            .map(|res| {
                let batch: Vec<Result<ServiceEvent>> = match res {
                    Ok(ev) => events_from(ev).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(anyhow::Error::new(e).context("service watch transport"))],
                };
                stream::iter(batch)
            })
            .flatten()
            .boxed();
        Ok(stream)
    }
}

/// Flatten one watcher event into snapshot events. A watch restart replays
/// the full current list, which is what makes the controller level-triggered.
fn events_from(ev: Event<Service>) -> Vec<ServiceEvent> {
    match ev {
        Event::Applied(svc) => event_from(&svc, EventKind::Modified).into_iter().collect(),
        Event::Deleted(svc) => event_from(&svc, EventKind::Deleted).into_iter().collect(),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restarted; replaying current services");
            list.iter().filter_map(|svc| event_from(svc, EventKind::Added)).collect()
        }
    }
}

fn event_from(svc: &Service, kind: EventKind) -> Option<ServiceEvent> {
    match snapshot_from(svc) {
        Some(snapshot) => Some(ServiceEvent { kind, snapshot }),
        None => {
            warn!("dropping service object without namespace/name");
            None
        }
    }
}

/// Project the API object onto the snapshot model. Only identity is
/// required; a service missing spec or status fields simply derives nothing
/// downstream.
fn snapshot_from(svc: &Service) -> Option<ServiceSnapshot> {
    let name = svc.metadata.name.clone()?;
    let namespace = svc.metadata.namespace.clone()?;
    let spec = svc.spec.clone().unwrap_or_default();
    let ports = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            u16::try_from(p.port)
                .ok()
                .map(|port| ServicePort { port, protocol: Protocol::parse(p.protocol.as_deref()) })
        })
        .collect();
    let ingress_address = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|entry| entry.ip.clone().or_else(|| entry.hostname.clone()));
    Some(ServiceSnapshot {
        id: ServiceId::new(namespace, name),
        kind: spec.type_.unwrap_or_default(),
        ports,
        annotations: svc.metadata.annotations.clone().unwrap_or_default(),
        ingress_address,
    })
}
