//! Conversions from the raw Kubernetes API objects delivered by the
//! informer stream into this system's reduced [`ruleset::model`] types.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::ResourceExt;
use ruleset::model::{ContainerPort, NpmNamespace, NpmPod, Protocol};

pub fn to_npm_pod(pod: &Pod) -> NpmPod {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let uid = pod.uid().unwrap_or_default();
    let labels: BTreeMap<String, String> = pod.labels().clone().into_iter().collect();

    let spec = pod.spec.as_ref();
    let host_network = spec.and_then(|s| s.host_network).unwrap_or(false);
    let container_ports = spec
        .map(|s| {
            s.containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .map(|p| ContainerPort {
                    name: p.name.clone(),
                    protocol: match p.protocol.as_deref() {
                        Some("UDP") => Protocol::Udp,
                        _ => Protocol::Tcp,
                    },
                    port: u16::try_from(p.container_port).unwrap_or(0),
                })
                .collect()
        })
        .unwrap_or_default();

    let status = pod.status.as_ref();
    let ip = status.and_then(|s| s.pod_ip.clone());
    let phase_terminal = status
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
    let deletion_grace_seconds = pod.metadata.deletion_grace_period_seconds;

    NpmPod {
        namespace,
        name,
        uid,
        ip,
        labels,
        container_ports,
        host_network,
        phase_terminal,
        deletion_grace_seconds,
    }
}

pub fn to_npm_namespace(ns: &Namespace) -> NpmNamespace {
    NpmNamespace {
        name: ns.name_any(),
        labels: ns.labels().clone().into_iter().collect(),
    }
}
