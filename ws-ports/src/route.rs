//! Route objects for one published port.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;
use ws_orchestrator::naming;
use ws_orchestrator::resources;

/// Ingress `port-forward-<port>` for `<subdomain>-<port>.<domain>`.
pub fn port_ingress(
    namespace: &str,
    subdomain: &str,
    domain: &str,
    port: u16,
    tls_secret: &str,
) -> Ingress {
    let labels = BTreeMap::from([
        (
            naming::APP_LABEL.to_string(),
            naming::APP_WORKSPACE.to_string(),
        ),
        (naming::PORT_LABEL.to_string(), port.to_string()),
    ]);
    resources::host_ingress(
        namespace,
        &naming::route_name(port),
        &naming::port_host(subdomain, port, domain),
        port,
        tls_secret,
        labels,
    )
}

pub fn port_service_entry(port: u16) -> ServicePort {
    resources::service_port(&naming::service_port_name(port), port)
}

pub fn public_url(subdomain: &str, domain: &str, port: u16) -> String {
    format!("https://{}", naming::port_host(subdomain, port, domain))
}

/// Whether `ingress` already routes `host`.
pub fn routes_host(ingress: &Ingress, host: &str) -> bool {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .is_some_and(|rules| rules.iter().any(|r| r.host.as_deref() == Some(host)))
}

pub fn service_exposes(service: &Service, port: u16) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| ports.iter().any(|p| p.port == i32::from(port)))
}
