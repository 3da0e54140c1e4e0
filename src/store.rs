//! Object store: the last observed version of every watched object
//!
//! Watchers feed the store through a single writer entry point
//! ([`Store::apply`]). Every mutation replaces the current [`Snapshot`] with
//! a copy-on-write successor, so renders work against an immutable view that
//! never changes under their feet while watch events keep arriving.
//!
//! Two reverse indices are maintained on every write:
//! - gateway -> routes whose parentRefs name it
//! - service -> EndpointSlices labelled with its name
//!
//! Each effective mutation bumps the snapshot generation and pokes the
//! render trigger. The trigger channel has room for one pending signal;
//! when it is already full a render is pending and will observe the newer
//! snapshot anyway, so bursts of events coalesce into one render.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::crd::{
    Dataplane, Gateway, GatewayClass, GatewayConfig, ObjectKey, ObjectKind, ResourceKey, UdpRoute,
};
use crate::{Error, LABEL_SERVICE_NAME};

/// Any object the store can hold
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    /// A GatewayClass
    GatewayClass(GatewayClass),
    /// A GatewayConfig
    GatewayConfig(GatewayConfig),
    /// A Gateway
    Gateway(Gateway),
    /// A UDPRoute
    UdpRoute(UdpRoute),
    /// A Service
    Service(Service),
    /// An EndpointSlice
    EndpointSlice(EndpointSlice),
    /// A Secret
    Secret(Secret),
    /// A Node
    Node(Node),
    /// A Dataplane
    Dataplane(Dataplane),
}

/// Types the store can hold, with their kind tag
pub trait StoreObject: Resource + Clone + Into<Object> {
    /// Kind tag of this type
    const KIND: ObjectKind;
}

macro_rules! store_object {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Object {
                fn from(obj: $ty) -> Self {
                    Object::$variant(obj)
                }
            }

            impl StoreObject for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;
            }
        )*

        impl Object {
            /// Kind of the object
            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Object::$variant(_) => ObjectKind::$variant,)*
                }
            }

            /// Namespace and name of the object
            pub fn key(&self) -> ObjectKey {
                match self {
                    $(Object::$variant(o) => ObjectKey::of(o),)*
                }
            }

            /// Resource version as observed from the API server
            pub fn resource_version(&self) -> Option<String> {
                match self {
                    $(Object::$variant(o) => o.resource_version(),)*
                }
            }
        }
    };
}

store_object! {
    GatewayClass => GatewayClass,
    GatewayConfig => GatewayConfig,
    Gateway => Gateway,
    UdpRoute => UdpRoute,
    Service => Service,
    EndpointSlice => EndpointSlice,
    Secret => Secret,
    Node => Node,
    Dataplane => Dataplane,
}

impl Object {
    /// Kind-qualified key of the object
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.key())
    }

    fn validate(&self) -> Result<(), Error> {
        let key = self.key();
        if key.name.is_empty() {
            return Err(Error::validation_for(
                self.resource_key().to_string(),
                "metadata.name is required",
            ));
        }
        if self.kind().is_namespaced() && key.namespace.as_deref().map_or(true, str::is_empty) {
            return Err(Error::validation_for(
                self.resource_key().to_string(),
                "metadata.namespace is required",
            ));
        }
        Ok(())
    }
}

/// A mutation fed to the store by a watcher
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// Object was added or modified
    Upsert(Object),
    /// Object was deleted
    Delete(ResourceKey),
    /// Full relist of one kind; objects not in the list are removed
    Replace(ObjectKind, Vec<Object>),
}

/// Signal sent to the renderer after an effective mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    /// Snapshot generation after the mutation
    pub generation: u64,
    /// Object that changed (the first one, for relists)
    pub resource: ResourceKey,
}

/// Immutable view of the store at one generation
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    generation: u64,
    gateway_classes: BTreeMap<ObjectKey, Arc<GatewayClass>>,
    gateway_configs: BTreeMap<ObjectKey, Arc<GatewayConfig>>,
    gateways: BTreeMap<ObjectKey, Arc<Gateway>>,
    udp_routes: BTreeMap<ObjectKey, Arc<UdpRoute>>,
    services: BTreeMap<ObjectKey, Arc<Service>>,
    endpoint_slices: BTreeMap<ObjectKey, Arc<EndpointSlice>>,
    secrets: BTreeMap<ObjectKey, Arc<Secret>>,
    nodes: BTreeMap<ObjectKey, Arc<Node>>,
    dataplanes: BTreeMap<ObjectKey, Arc<Dataplane>>,

    routes_by_gateway: BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,
    slices_by_service: BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,
}

fn same_version<K: Resource + PartialEq>(stored: &K, incoming: &K) -> bool {
    match (
        stored.meta().resource_version.as_deref(),
        incoming.meta().resource_version.as_deref(),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => stored == incoming,
    }
}

fn upsert<K: Resource + PartialEq>(
    map: &mut BTreeMap<ObjectKey, Arc<K>>,
    key: ObjectKey,
    obj: K,
) -> bool {
    if map.get(&key).is_some_and(|stored| same_version(stored.as_ref(), &obj)) {
        return false;
    }
    map.insert(key, Arc::new(obj));
    true
}

fn is_current<K: Resource + PartialEq>(
    map: &BTreeMap<ObjectKey, Arc<K>>,
    key: &ObjectKey,
    obj: &K,
) -> bool {
    map.get(key).is_some_and(|stored| same_version(stored.as_ref(), obj))
}

fn owned<K: StoreObject>(object: &Arc<K>) -> Object {
    object.as_ref().clone().into()
}

fn service_of_slice(slice: &EndpointSlice) -> Option<ObjectKey> {
    let namespace = slice.namespace()?;
    let service = slice.labels().get(LABEL_SERVICE_NAME)?;
    Some(ObjectKey::namespaced(namespace, service.clone()))
}

fn unlink(index: &mut BTreeMap<ObjectKey, BTreeSet<ObjectKey>>, from: &ObjectKey, to: &ObjectKey) {
    if let Some(set) = index.get_mut(from) {
        set.remove(to);
        if set.is_empty() {
            index.remove(from);
        }
    }
}

impl Snapshot {
    /// Generation of this snapshot; bumped on every effective mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up a GatewayClass by name
    pub fn gateway_class(&self, name: &str) -> Option<&Arc<GatewayClass>> {
        self.gateway_classes.get(&ObjectKey::cluster(name))
    }

    /// All GatewayClasses, ordered by name
    pub fn gateway_classes(&self) -> impl Iterator<Item = &Arc<GatewayClass>> {
        self.gateway_classes.values()
    }

    /// Look up a GatewayConfig
    pub fn gateway_config(&self, key: &ObjectKey) -> Option<&Arc<GatewayConfig>> {
        self.gateway_configs.get(key)
    }

    /// Look up a Gateway
    pub fn gateway(&self, key: &ObjectKey) -> Option<&Arc<Gateway>> {
        self.gateways.get(key)
    }

    /// All Gateways, ordered by key
    pub fn gateways(&self) -> impl Iterator<Item = (&ObjectKey, &Arc<Gateway>)> {
        self.gateways.iter()
    }

    /// Gateways of a class
    pub fn gateways_of_class<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = (&'a ObjectKey, &'a Arc<Gateway>)> + 'a {
        self.gateways
            .iter()
            .filter(move |(_, g)| g.spec.gateway_class_name == class)
    }

    /// Look up a UDPRoute
    pub fn udp_route(&self, key: &ObjectKey) -> Option<&Arc<UdpRoute>> {
        self.udp_routes.get(key)
    }

    /// All UDPRoutes, ordered by key
    pub fn udp_routes(&self) -> impl Iterator<Item = (&ObjectKey, &Arc<UdpRoute>)> {
        self.udp_routes.iter()
    }

    /// Routes whose parentRefs name the gateway, ordered by key
    pub fn routes_for_gateway<'a>(
        &'a self,
        gateway: &ObjectKey,
    ) -> impl Iterator<Item = (&'a ObjectKey, &'a Arc<UdpRoute>)> + 'a {
        self.routes_by_gateway
            .get(gateway)
            .into_iter()
            .flatten()
            .filter_map(|k| self.udp_routes.get_key_value(k))
    }

    /// Look up a Service
    pub fn service(&self, key: &ObjectKey) -> Option<&Arc<Service>> {
        self.services.get(key)
    }

    /// EndpointSlices belonging to a service, ordered by key
    pub fn endpoint_slices_for_service<'a>(
        &'a self,
        service: &ObjectKey,
    ) -> impl Iterator<Item = &'a Arc<EndpointSlice>> + 'a {
        self.slices_by_service
            .get(service)
            .into_iter()
            .flatten()
            .filter_map(|k| self.endpoint_slices.get(k))
    }

    /// Look up a Secret
    pub fn secret(&self, key: &ObjectKey) -> Option<&Arc<Secret>> {
        self.secrets.get(key)
    }

    /// All Nodes, ordered by name
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// Look up a Dataplane by name
    pub fn dataplane(&self, name: &str) -> Option<&Arc<Dataplane>> {
        self.dataplanes.get(&ObjectKey::cluster(name))
    }

    /// Whether the store holds the resource
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    /// Owned copy of one object
    pub fn get(&self, key: &ResourceKey) -> Option<Object> {
        let k = &key.key;
        match key.kind {
            ObjectKind::GatewayClass => self.gateway_classes.get(k).map(owned),
            ObjectKind::GatewayConfig => self.gateway_configs.get(k).map(owned),
            ObjectKind::Gateway => self.gateways.get(k).map(owned),
            ObjectKind::UdpRoute => self.udp_routes.get(k).map(owned),
            ObjectKind::Service => self.services.get(k).map(owned),
            ObjectKind::EndpointSlice => self.endpoint_slices.get(k).map(owned),
            ObjectKind::Secret => self.secrets.get(k).map(owned),
            ObjectKind::Node => self.nodes.get(k).map(owned),
            ObjectKind::Dataplane => self.dataplanes.get(k).map(owned),
        }
    }

    /// Keys of every stored object of a kind, ordered
    pub fn keys(&self, kind: ObjectKind) -> Vec<ObjectKey> {
        fn keys_of<V>(map: &BTreeMap<ObjectKey, V>) -> Vec<ObjectKey> {
            map.keys().cloned().collect()
        }
        match kind {
            ObjectKind::GatewayClass => keys_of(&self.gateway_classes),
            ObjectKind::GatewayConfig => keys_of(&self.gateway_configs),
            ObjectKind::Gateway => keys_of(&self.gateways),
            ObjectKind::UdpRoute => keys_of(&self.udp_routes),
            ObjectKind::Service => keys_of(&self.services),
            ObjectKind::EndpointSlice => keys_of(&self.endpoint_slices),
            ObjectKind::Secret => keys_of(&self.secrets),
            ObjectKind::Node => keys_of(&self.nodes),
            ObjectKind::Dataplane => keys_of(&self.dataplanes),
        }
    }

    /// Owned copies of every stored object of a kind, ordered by key
    pub fn list(&self, kind: ObjectKind) -> Vec<Object> {
        self.keys(kind)
            .into_iter()
            .filter_map(|key| self.get(&ResourceKey::new(kind, key)))
            .collect()
    }

    fn is_current(&self, object: &Object) -> bool {
        let key = object.key();
        match object {
            Object::GatewayClass(o) => is_current(&self.gateway_classes, &key, o),
            Object::GatewayConfig(o) => is_current(&self.gateway_configs, &key, o),
            Object::Gateway(o) => is_current(&self.gateways, &key, o),
            Object::UdpRoute(o) => is_current(&self.udp_routes, &key, o),
            Object::Service(o) => is_current(&self.services, &key, o),
            Object::EndpointSlice(o) => is_current(&self.endpoint_slices, &key, o),
            Object::Secret(o) => is_current(&self.secrets, &key, o),
            Object::Node(o) => is_current(&self.nodes, &key, o),
            Object::Dataplane(o) => is_current(&self.dataplanes, &key, o),
        }
    }

    fn insert(&mut self, object: Object) -> bool {
        let key = object.key();
        match object {
            Object::GatewayClass(o) => upsert(&mut self.gateway_classes, key, o),
            Object::GatewayConfig(o) => upsert(&mut self.gateway_configs, key, o),
            Object::Gateway(o) => upsert(&mut self.gateways, key, o),
            Object::UdpRoute(o) => {
                let previous = self.udp_routes.get(&key).cloned();
                if !upsert(&mut self.udp_routes, key.clone(), o) {
                    return false;
                }
                if let Some(previous) = previous {
                    self.unindex_route(&key, &previous);
                }
                if let Some(route) = self.udp_routes.get(&key).cloned() {
                    self.index_route(&key, &route);
                }
                true
            }
            Object::Service(o) => upsert(&mut self.services, key, o),
            Object::EndpointSlice(o) => {
                let previous = self.endpoint_slices.get(&key).and_then(|s| service_of_slice(s));
                if !upsert(&mut self.endpoint_slices, key.clone(), o) {
                    return false;
                }
                if let Some(service) = previous {
                    unlink(&mut self.slices_by_service, &service, &key);
                }
                let service = self.endpoint_slices.get(&key).and_then(|s| service_of_slice(s));
                if let Some(service) = service {
                    self.slices_by_service.entry(service).or_default().insert(key);
                }
                true
            }
            Object::Secret(o) => upsert(&mut self.secrets, key, o),
            Object::Node(o) => upsert(&mut self.nodes, key, o),
            Object::Dataplane(o) => upsert(&mut self.dataplanes, key, o),
        }
    }

    fn remove(&mut self, key: &ResourceKey) -> bool {
        let k = &key.key;
        match key.kind {
            ObjectKind::GatewayClass => self.gateway_classes.remove(k).is_some(),
            ObjectKind::GatewayConfig => self.gateway_configs.remove(k).is_some(),
            ObjectKind::Gateway => self.gateways.remove(k).is_some(),
            ObjectKind::UdpRoute => match self.udp_routes.remove(k) {
                Some(route) => {
                    self.unindex_route(k, &route);
                    true
                }
                None => false,
            },
            ObjectKind::Service => self.services.remove(k).is_some(),
            ObjectKind::EndpointSlice => match self.endpoint_slices.remove(k) {
                Some(slice) => {
                    if let Some(service) = service_of_slice(&slice) {
                        unlink(&mut self.slices_by_service, &service, k);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::Secret => self.secrets.remove(k).is_some(),
            ObjectKind::Node => self.nodes.remove(k).is_some(),
            ObjectKind::Dataplane => self.dataplanes.remove(k).is_some(),
        }
    }

    fn index_route(&mut self, key: &ObjectKey, route: &UdpRoute) {
        for gateway in route.parent_gateways() {
            self.routes_by_gateway
                .entry(gateway)
                .or_default()
                .insert(key.clone());
        }
    }

    fn unindex_route(&mut self, key: &ObjectKey, route: &UdpRoute) {
        for gateway in route.parent_gateways() {
            unlink(&mut self.routes_by_gateway, &gateway, key);
        }
    }

    fn apply(&mut self, event: StoreEvent) -> Result<Option<ResourceKey>, Error> {
        match event {
            StoreEvent::Upsert(object) => {
                object.validate()?;
                let resource = object.resource_key();
                Ok(self.insert(object).then_some(resource))
            }
            StoreEvent::Delete(key) => Ok(self.remove(&key).then_some(key)),
            StoreEvent::Replace(kind, objects) => {
                let mut first_change = None;
                let mut seen = BTreeSet::new();
                for object in objects {
                    if object.kind() != kind {
                        warn!(
                            expected = %kind,
                            got = %object.kind(),
                            "Dropping mismatched object from relist"
                        );
                        continue;
                    }
                    if let Err(e) = object.validate() {
                        warn!(error = %e, "Dropping invalid object from relist");
                        continue;
                    }
                    let resource = object.resource_key();
                    seen.insert(resource.key.clone());
                    if self.insert(object) && first_change.is_none() {
                        first_change = Some(resource);
                    }
                }
                for stale in self.keys(kind).into_iter().filter(|k| !seen.contains(k)) {
                    let resource = ResourceKey::new(kind, stale);
                    if self.remove(&resource) && first_change.is_none() {
                        first_change = Some(resource);
                    }
                }
                Ok(first_change)
            }
        }
    }
}

/// Shared object store with copy-on-write snapshots
#[derive(Default)]
pub struct Store {
    state: RwLock<Arc<Snapshot>>,
    trigger: Mutex<Option<mpsc::Sender<StoreChange>>>,
}

impl Store {
    /// Create an empty store with no render trigger attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the channel poked after every effective mutation
    pub fn set_trigger(&self, trigger: mpsc::Sender<StoreChange>) {
        *self.trigger.lock() = Some(trigger);
    }

    /// Current snapshot; cheap, and never blocks on writers for long
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.read().clone()
    }

    /// Insert or replace an object
    pub fn upsert(&self, object: impl Into<Object>) -> Result<bool, Error> {
        self.apply(StoreEvent::Upsert(object.into()))
    }

    /// Remove an object; removing a missing object is a no-op
    pub fn delete(&self, key: &ResourceKey) -> bool {
        self.apply(StoreEvent::Delete(key.clone())).unwrap_or(false)
    }

    /// Replace every object of a kind with the given list
    pub fn replace(&self, kind: ObjectKind, objects: Vec<Object>) -> Result<bool, Error> {
        self.apply(StoreEvent::Replace(kind, objects))
    }

    /// Apply one mutation atomically
    ///
    /// Returns whether the store changed. Invalid objects are rejected with
    /// [`Error::Validation`] and leave the store untouched.
    pub fn apply(&self, event: StoreEvent) -> Result<bool, Error> {
        let change = {
            let mut guard = self.state.write();
            if let StoreEvent::Upsert(object) = &event {
                if guard.is_current(object) {
                    trace!(resource = %object.resource_key(), "Ignoring unchanged object");
                    return Ok(false);
                }
            }
            let snapshot = Arc::make_mut(&mut *guard);
            match snapshot.apply(event)? {
                Some(resource) => {
                    snapshot.generation += 1;
                    StoreChange {
                        generation: snapshot.generation,
                        resource,
                    }
                }
                None => return Ok(false),
            }
        };

        debug!(generation = change.generation, resource = %change.resource, "Store changed");
        self.notify(change);
        Ok(true)
    }

    fn notify(&self, change: StoreChange) {
        let guard = self.trigger.lock();
        let Some(trigger) = guard.as_ref() else {
            return;
        };
        match trigger.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("Render already pending, coalescing");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Render trigger closed");
            }
        }
    }
}
