//! Kubernetes watchers feeding the store
//!
//! One `kube::runtime::watcher` stream per kind. Initial lists and relists
//! are buffered and handed to the store as a single replace, so objects
//! deleted while the watch was down disappear too.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{Dataplane, Gateway, GatewayClass, GatewayConfig, ObjectKey, ResourceKey, UdpRoute};
use crate::store::{Object, Store, StoreEvent, StoreObject};

/// Only TLS secrets can back listener certificates
const TLS_SECRET_SELECTOR: &str = "type=kubernetes.io/tls";

/// Translate a watcher event into a store event
///
/// Objects of an initial list accumulate in `relist` until the list is
/// complete.
pub fn translate<K: StoreObject>(
    event: watcher::Event<K>,
    relist: &mut Vec<Object>,
) -> Option<StoreEvent> {
    match event {
        watcher::Event::Apply(obj) => Some(StoreEvent::Upsert(obj.into())),
        watcher::Event::Delete(obj) => Some(StoreEvent::Delete(ResourceKey::new(
            K::KIND,
            ObjectKey::of(&obj),
        ))),
        watcher::Event::Init => {
            relist.clear();
            None
        }
        watcher::Event::InitApply(obj) => {
            relist.push(obj.into());
            None
        }
        watcher::Event::InitDone => Some(StoreEvent::Replace(K::KIND, std::mem::take(relist))),
    }
}

/// Mirror one kind into the store until cancelled
pub async fn watch_kind<K>(
    api: Api<K>,
    config: watcher::Config,
    store: Arc<Store>,
    token: CancellationToken,
) where
    K: StoreObject + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    info!(kind = %K::KIND, "Starting watch");
    let stream = watcher(api, config).default_backoff();
    tokio::pin!(stream);
    let mut relist = Vec::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    let Some(event) = translate(event, &mut relist) else {
                        continue;
                    };
                    match store.apply(event) {
                        Ok(true) => {}
                        Ok(false) => debug!(kind = %K::KIND, "Watch event changed nothing"),
                        Err(e) => warn!(kind = %K::KIND, error = %e, "Rejected watched object"),
                    }
                }
                Some(Err(e)) => warn!(kind = %K::KIND, error = %e, "Watch error, backing off"),
                None => break,
            },
        }
    }
    info!(kind = %K::KIND, "Watch stopped");
}

/// Start watchers for every kind the renderer reads
pub fn spawn_watchers(
    client: Client,
    store: Arc<Store>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let all = watcher::Config::default().any_semantic();
    vec![
        tokio::spawn(watch_kind(
            Api::<GatewayClass>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<GatewayConfig>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<Gateway>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<UdpRoute>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<Service>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<EndpointSlice>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<Secret>::all(client.clone()),
            all.clone().fields(TLS_SECRET_SELECTOR),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(
            Api::<Node>::all(client.clone()),
            all.clone(),
            store.clone(),
            token.clone(),
        )),
        tokio::spawn(watch_kind(Api::<Dataplane>::all(client), all, store, token)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GatewayClassSpec, ObjectKind};

    fn class(name: &str) -> GatewayClass {
        let mut class = GatewayClass::new(
            name,
            GatewayClassSpec {
                controller_name: crate::DEFAULT_CONTROLLER_NAME.to_string(),
                ..Default::default()
            },
        );
        class.metadata.resource_version = Some("1".to_string());
        class
    }

    #[test]
    fn test_apply_and_delete_map_directly() {
        let mut relist = Vec::new();
        let upsert = translate(watcher::Event::Apply(class("a")), &mut relist);
        assert!(matches!(upsert, Some(StoreEvent::Upsert(Object::GatewayClass(_)))));

        let delete = translate(watcher::Event::Delete(class("a")), &mut relist);
        assert!(matches!(
            delete,
            Some(StoreEvent::Delete(key)) if key == ResourceKey::gateway_class("a")
        ));
    }

    /// Story: a relist after a watch outage replaces the kind wholesale
    #[test]
    fn story_relist_becomes_one_replace() {
        let mut relist = vec![Object::from(class("stale"))];
        assert!(translate::<GatewayClass>(watcher::Event::Init, &mut relist).is_none());
        assert!(relist.is_empty());
        assert!(translate(watcher::Event::InitApply(class("a")), &mut relist).is_none());
        assert!(translate(watcher::Event::InitApply(class("b")), &mut relist).is_none());

        match translate::<GatewayClass>(watcher::Event::InitDone, &mut relist) {
            Some(StoreEvent::Replace(kind, objects)) => {
                assert_eq!(kind, ObjectKind::GatewayClass);
                assert_eq!(objects.len(), 2);
            }
            other => panic!("expected replace, got {other:?}"),
        }
        assert!(relist.is_empty());
    }

    #[test]
    fn test_relist_feeds_store() {
        let store = Store::new();
        store.upsert(class("stale")).unwrap();

        let mut relist = Vec::new();
        translate::<GatewayClass>(watcher::Event::Init, &mut relist);
        translate(watcher::Event::InitApply(class("fresh")), &mut relist);
        let replace = translate::<GatewayClass>(watcher::Event::InitDone, &mut relist).unwrap();
        assert!(store.apply(replace).unwrap());

        let snapshot = store.snapshot();
        assert!(snapshot.gateway_class("fresh").is_some());
        assert!(snapshot.gateway_class("stale").is_none());
    }
}
