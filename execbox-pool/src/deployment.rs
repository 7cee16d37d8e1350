use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::config::PoolSpec;

/// Label carrying the owning pool's name.
pub const POOL_LABEL: &str = "execbox/pool";

/// Label flipped to `"true"` when a worker is claimed, which removes it from
/// the pool's watch selector.
pub const CLAIMED_LABEL: &str = "execbox/claimed";

const GVISOR_RUNTIME_CLASS: &str = "gvisor";

/// Workers are disposable; no reason to wait for them on deletion.
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 1;

/// Labels stamped on every unclaimed worker of a pool.
#[must_use]
pub fn pool_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (POOL_LABEL.to_string(), pool.to_string()),
        (CLAIMED_LABEL.to_string(), "false".to_string()),
    ])
}

/// Selector matching the ready-to-claim workers of a pool.
#[must_use]
pub fn watch_selector(pool: &str) -> String {
    format!("{POOL_LABEL}={pool},{CLAIMED_LABEL}=false")
}

/// Builds the declarative deployment backing a pool. The pod template runs a
/// single `sleep infinity` container that commands get exec'd into.
#[must_use]
pub fn build_deployment(spec: &PoolSpec) -> Deployment {
    let labels = pool_labels(&spec.name);

    let mut requests = BTreeMap::new();
    if let Some(cpu) = spec.cpu {
        requests.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", u32::from(cpu) * 100)),
        );
    }
    if let Some(memory_mib) = spec.memory_mib {
        requests.insert("memory".to_string(), Quantity(format!("{memory_mib}Mi")));
    }
    let resources = (!requests.is_empty()).then(|| ResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.size),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: spec.name.clone(),
                        image: Some(spec.image.clone()),
                        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                        resources,
                        ..Default::default()
                    }],
                    automount_service_account_token: Some(false),
                    enable_service_links: Some(false),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
                    runtime_class_name: spec
                        .sandboxed
                        .then(|| GVISOR_RUNTIME_CLASS.to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
