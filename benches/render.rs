//! Criterion benchmarks for the renderer
//!
//! A full sweep runs on every store change, so its cost as the number of
//! gateways and routes grows bounds how fast changes reach the relays.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use rand::prelude::*;

use turngate::config::ControllerConfig;
use turngate::crd::{
    BackendRef, Dataplane, DataplaneSpec, Gateway, GatewayAddress, GatewayClass, GatewayClassSpec,
    GatewayConfig, GatewayConfigSpec, GatewaySpec, Listener, ObjectKey, ParametersReference,
    ParentReference, UdpRoute, UdpRouteRule, UdpRouteSpec, TURNGATE_GROUP,
};
use turngate::render::Renderer;
use turngate::store::Store;
use turngate::{DEFAULT_CONTROLLER_NAME, LABEL_SERVICE_NAME};

const NAMESPACE: &str = "bench";
const BACKENDS: usize = 16;

// =============================================================================
// Fixtures
// =============================================================================

fn base_store() -> Store {
    let store = Store::new();
    store
        .upsert(GatewayClass::new(
            "turngate",
            GatewayClassSpec {
                controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
                parameters_ref: Some(ParametersReference {
                    group: TURNGATE_GROUP.to_string(),
                    kind: "GatewayConfig".to_string(),
                    name: "turngate-config".to_string(),
                    namespace: Some("turngate".to_string()),
                }),
                description: None,
            },
        ))
        .unwrap();
    let mut config = GatewayConfig::new("turngate-config", GatewayConfigSpec::default());
    config.metadata.namespace = Some("turngate".to_string());
    store.upsert(config).unwrap();
    store
        .upsert(Dataplane::new(
            "default",
            DataplaneSpec {
                image: "turngate/relay:latest".to_string(),
                replicas: 1,
                ..Default::default()
            },
        ))
        .unwrap();

    for i in 0..BACKENDS {
        let name = format!("backend-{i}");
        let mut svc = Service::default();
        svc.metadata.name = Some(name.clone());
        svc.metadata.namespace = Some(NAMESPACE.to_string());
        svc.spec = Some(ServiceSpec {
            cluster_ip: Some(format!("10.96.0.{}", i + 1)),
            ..Default::default()
        });
        store.upsert(svc).unwrap();

        let mut slice = EndpointSlice::default();
        slice.metadata.name = Some(format!("{name}-1"));
        slice.metadata.namespace = Some(NAMESPACE.to_string());
        slice.metadata.labels = Some(BTreeMap::from([(LABEL_SERVICE_NAME.to_string(), name)]));
        slice.address_type = "IPv4".to_string();
        slice.endpoints = (1..=8)
            .map(|host| Endpoint {
                addresses: vec![format!("10.1.{i}.{host}")],
                ..Default::default()
            })
            .collect();
        store.upsert(slice).unwrap();
    }
    store
}

fn gateway(name: &str) -> Gateway {
    let mut gw = Gateway::new(
        name,
        GatewaySpec {
            gateway_class_name: "turngate".to_string(),
            listeners: vec![
                Listener {
                    name: "udp".to_string(),
                    protocol: "TURN-UDP".to_string(),
                    port: 3478,
                    ..Default::default()
                },
                Listener {
                    name: "tcp".to_string(),
                    protocol: "TURN-TCP".to_string(),
                    port: 3478,
                    ..Default::default()
                },
            ],
            addresses: vec![GatewayAddress {
                type_: None,
                value: "203.0.113.10".to_string(),
            }],
        },
    );
    gw.metadata.namespace = Some(NAMESPACE.to_string());
    gw.metadata.uid = Some(format!("{name}-uid"));
    gw.metadata.generation = Some(1);
    gw
}

fn route(name: &str, gateway: &str, backends: &[usize]) -> UdpRoute {
    let mut route = UdpRoute::new(
        name,
        UdpRouteSpec {
            parent_refs: vec![ParentReference {
                name: gateway.to_string(),
                ..Default::default()
            }],
            rules: vec![UdpRouteRule {
                backend_refs: backends
                    .iter()
                    .map(|b| BackendRef {
                        name: format!("backend-{b}"),
                        ..Default::default()
                    })
                    .collect(),
            }],
        },
    );
    route.metadata.namespace = Some(NAMESPACE.to_string());
    route
}

/// Store with `gateways` gateways, each carrying a few routes to random backends
fn populated_store(gateways: usize) -> Store {
    let store = base_store();
    let mut rng = rand::thread_rng();
    for g in 0..gateways {
        let gw_name = format!("gateway-{g}");
        store.upsert(gateway(&gw_name)).unwrap();
        for r in 0..rng.gen_range(1..=4) {
            let count = rng.gen_range(1..=3);
            let backends: Vec<usize> = (0..BACKENDS).choose_multiple(&mut rng, count);
            store.upsert(route(&format!("{gw_name}-route-{r}"), &gw_name, &backends)).unwrap();
        }
    }
    store
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_render_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_all");
    let renderer = Renderer::new(&ControllerConfig::default());

    for size in [10, 100, 500] {
        let store = populated_store(size);
        let snapshot = store.snapshot();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("gateways", size), &size, |b, _| {
            b.iter(|| black_box(renderer.render_all(black_box(&snapshot))))
        });
    }
    group.finish();
}

fn bench_render_gateway(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_gateway");
    let renderer = Renderer::new(&ControllerConfig::default());

    for size in [10, 100, 500] {
        let store = populated_store(size);
        let snapshot = store.snapshot();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("single", size), &size, |b, &size| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let name = format!("gateway-{}", rng.gen_range(0..size));
                let key = ObjectKey::namespaced(NAMESPACE, name);
                black_box(renderer.render_gateway(&snapshot, &key))
            })
        });
    }
    group.finish();
}

fn bench_store_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    for size in [100, 500] {
        let store = populated_store(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("upsert_then_snapshot", size), &size, |b, &size| {
            let mut rng = rand::thread_rng();
            let mut generation = 1;
            b.iter(|| {
                generation += 1;
                let mut gw = gateway(&format!("gateway-{}", rng.gen_range(0..size)));
                gw.metadata.generation = Some(generation);
                store.upsert(gw).unwrap();
                black_box(store.snapshot())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_render_all, bench_render_gateway, bench_store_churn);
criterion_main!(benches);
