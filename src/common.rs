use k8s_openapi::api::core::v1 as corev1;

use crate::mysqlcluster_types::*;

// Ports every member exposes.
pub const MYSQL_PORT: i32 = 3306;
pub const MYSQL_PORT_NAME: &str = "mysql";
pub const GROUP_COMM_PORT: i32 = 33061;
pub const GROUP_COMM_PORT_NAME: &str = "gr-node-comm";
pub const ADMIN_PORT: i32 = 33060;
pub const ADMIN_PORT_NAME: &str = "gr-admin";

pub const DATA_DIR: &str = "/data";
pub const CONFIG_FILE: &str = "my.cnf";

pub const ROOT_USER: &str = "root";
pub const MYSQL_DB: &str = "mysql";
pub const ROOT_PASSWORD_KEY: &str = "MYSQL_ROOT_PASSWORD";
// base64; decoded at use
const DEFAULT_ROOT_PASSWORD: &str = "TXlTUUxAMjAyNA==";
pub const REPLICATION_USER: &str = "repl";
const REPLICATION_PASSWORD: &str = "TXlTUUxAMjAyNA==";

pub const FINALIZER_NAME: &str = "mysqlcluster.mysql.dev/finalizer";
pub const GROUP_NAME_ANNOTATION: &str = "mysql.dev/group-name";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

pub fn cluster_name(cluster: &MySqlCluster) -> String {
    cluster.metadata.name.as_ref().unwrap().clone()
}

pub fn cluster_namespace(cluster: &MySqlCluster) -> String {
    cluster.metadata.namespace.as_ref().unwrap().clone()
}

pub fn headless_service_name(cluster: &MySqlCluster) -> String {
    cluster_name(cluster) + "-headless"
}

pub fn client_service_name(cluster: &MySqlCluster) -> String {
    cluster_name(cluster)
}

pub fn secret_name(cluster: &MySqlCluster) -> String {
    cluster_name(cluster) + "-secret"
}

pub fn config_map_name(cluster: &MySqlCluster, ordinal: i32) -> String {
    format!("{}-config-{}", cluster_name(cluster), ordinal)
}

pub fn pvc_name(cluster: &MySqlCluster, ordinal: i32) -> String {
    format!("{}-db-{}", cluster_name(cluster), ordinal)
}

pub fn stateful_set_name(cluster: &MySqlCluster, ordinal: i32) -> String {
    format!("{}-{}", cluster_name(cluster), ordinal)
}

pub fn replication_password() -> String {
    decode_packaged(REPLICATION_PASSWORD)
}

/// Root password for driver sessions: the template's MYSQL_ROOT_PASSWORD
/// env var when declared, the packaged default otherwise.
pub fn root_password(cluster: &MySqlCluster) -> String {
    if let Some(envs) = cluster.spec.pod_template.env.as_ref() {
        for env in envs {
            if env.name == ROOT_PASSWORD_KEY {
                if let Some(value) = env.value.as_ref() {
                    return value.clone();
                }
            }
        }
    }
    decode_packaged(DEFAULT_ROOT_PASSWORD)
}

fn decode_packaged(encoded: &str) -> String {
    String::from_utf8(base64::decode(encoded).unwrap()).unwrap()
}

/// Client-facing address of the cluster, derived from its client service.
pub fn service_access_point(svc: &corev1::Service) -> String {
    let spec = match svc.spec.as_ref() {
        Some(spec) => spec,
        None => return String::new(),
    };
    let port = match spec.ports.as_ref().and_then(|p| p.first()) {
        Some(port) => port,
        None => return String::new(),
    };
    match spec.type_.as_deref() {
        Some("NodePort") => format!(
            "{}:{}",
            spec.cluster_ip.clone().unwrap_or_default(),
            port.node_port.unwrap_or_default()
        ),
        Some("LoadBalancer") => {
            // Ingress may not have been assigned yet.
            let ingress = svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|i| i.first());
            match ingress.and_then(|i| i.ip.as_ref()) {
                Some(ip) => format!("{}:{}", ip, port.port),
                None => String::new(),
            }
        }
        _ => format!(
            "{}:{}",
            spec.cluster_ip.clone().unwrap_or_default(),
            port.port
        ),
    }
}
