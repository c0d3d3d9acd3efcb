//! Names, labels and ports shared by the controller, the port exposer and the
//! usage tracker. Every component finds the others' objects through these.

/// Editor port served by the workspace container and routed on the base host.
pub const BASE_PORT: u16 = 8444;
/// Workspace-internal health endpoint polled by the usage tracker.
pub const HEALTH_PORT: u16 = 8445;
/// Ports that are never published as port-forward routes.
pub const RESERVED_PORTS: [u16; 2] = [BASE_PORT, HEALTH_PORT];
/// Ports at or below this are never published.
pub const MIN_EXPOSED_PORT: u16 = 1024;

pub const NAMESPACE_PREFIX: &str = "workspace-";

pub const APP_LABEL: &str = "app";
pub const APP_WORKSPACE: &str = "workspace";
pub const WORKSPACE_ID_LABEL: &str = "workspaceId";
pub const COMPONENT_LABEL: &str = "component";
pub const PORT_LABEL: &str = "workspace/port";

/// Selector matching every workspace namespace.
pub const WORKSPACE_NAMESPACE_SELECTOR: &str = "app=workspace";
/// Selector matching the primary workspace pod inside a namespace.
pub const WORKSPACE_POD_SELECTOR: &str = "component=workspace";

pub const DEPLOYMENT_NAME: &str = "workspace";
pub const SERVICE_NAME: &str = "workspace";
pub const INGRESS_NAME: &str = "workspace";
pub const PVC_NAME: &str = "workspace-data";
pub const SECRET_NAME: &str = "workspace-secret";
pub const PASSWORD_KEY: &str = "password";
pub const EXPOSER_ACCOUNT: &str = "port-exposer";

pub const WORKSPACE_CONTAINER: &str = "workspace";
pub const EXPOSER_CONTAINER: &str = "port-exposer";
pub const CLONE_CONTAINER: &str = "clone-repositories";
pub const BUILD_CONTAINER: &str = "build-image";

pub const DESCRIPTOR_CONFIG_MAP: &str = "workspace-info";
pub const DESCRIPTOR_KEY: &str = "info";
pub const DESCRIPTOR_LABEL: &str = "workspace-info";
pub const USAGE_CONFIG_MAP: &str = "workspace-usage";
pub const USAGE_KEY: &str = "usage.json";
pub const USAGE_LABEL: &str = "workspace-usage";

pub fn namespace_name(workspace_id: &str) -> String {
    format!("{NAMESPACE_PREFIX}{workspace_id}")
}

/// Ingress name for a published port.
pub fn route_name(port: u16) -> String {
    format!("port-forward-{port}")
}

pub fn service_port_name(port: u16) -> String {
    format!("port-{port}")
}

pub fn base_host(subdomain: &str, domain: &str) -> String {
    format!("{subdomain}.{domain}")
}

pub fn port_host(subdomain: &str, port: u16, domain: &str) -> String {
    format!("{subdomain}-{port}.{domain}")
}

/// Whether a listening port may be published as a route.
pub fn is_exposable_port(port: u16) -> bool {
    port > MIN_EXPOSED_PORT && !RESERVED_PORTS.contains(&port)
}

/// Workspace ids end up in namespace and label values, so they are limited to
/// lowercase DNS label characters.
pub fn is_valid_workspace_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() + NAMESPACE_PREFIX.len() <= 63
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !id.starts_with('-')
        && !id.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_and_routes() {
        assert_eq!(route_name(3000), "port-forward-3000");
        assert_eq!(port_host("abc", 3000, "ws.example.com"), "abc-3000.ws.example.com");
        assert_eq!(base_host("abc", "ws.example.com"), "abc.ws.example.com");
    }

    #[test]
    fn exposable_ports() {
        assert!(is_exposable_port(3000));
        assert!(is_exposable_port(1025));
        assert!(!is_exposable_port(1024));
        assert!(!is_exposable_port(80));
        assert!(!is_exposable_port(BASE_PORT));
        assert!(!is_exposable_port(HEALTH_PORT));
    }

    #[test]
    fn workspace_ids() {
        assert!(is_valid_workspace_id("ab12cd34"));
        assert!(!is_valid_workspace_id(""));
        assert!(!is_valid_workspace_id("../etc"));
        assert!(!is_valid_workspace_id("UPPER"));
        assert!(!is_valid_workspace_id("-lead"));
    }
}
