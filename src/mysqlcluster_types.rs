use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "mysql.dev", version = "v1", kind = "MySqlCluster")]
#[kube(shortname = "msc", namespaced)]
#[kube(status = "MySqlClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct MySqlClusterSpec {
    pub topology: ClusterTopology,
    pub pod_template: PodTemplate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
    /// Service type for the client service. ClusterIP when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_enabled: Option<bool>,
}

/// How the cluster is shaped. Selected once per pass at the spec boundary;
/// everything downstream branches on this enum, never on a kind string.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ClusterTopology {
    /// One standalone server, no replication group.
    SingleMember {},
    /// A group-replication cluster built from the listed role groups.
    Group { members: Vec<Member> },
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Member {
    pub role: MemberRole,
    pub size: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Primary,
    Secondary,
    Arbitrator,
}

/// Shared template for every member pod.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<corev1::ResourceRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<corev1::EnvVar>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<corev1::Probe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<corev1::Probe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub strategy_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MySqlClusterStatus {
    pub access_point: String,
    pub size: i32,
    pub ready: i32,
    pub age: String,
}

impl MySqlClusterStatus {
    /// Field-by-field change detection; these four fields are exactly what a
    /// status write may touch.
    pub fn changed(&self, other: &MySqlClusterStatus) -> bool {
        self.access_point != other.access_point
            || self.size != other.size
            || self.ready != other.ready
            || self.age != other.age
    }
}

impl MySqlClusterSpec {
    /// Total number of planned members across all role groups.
    pub fn replica_count(&self) -> i32 {
        match &self.topology {
            ClusterTopology::SingleMember {} => 1,
            ClusterTopology::Group { members } => members.iter().map(|m| m.size.max(0)).sum(),
        }
    }

    /// Whether the members form a replication group.
    pub fn cluster_mode(&self) -> bool {
        matches!(self.topology, ClusterTopology::Group { .. })
    }

    /// The role group supplying ordinal 0 must be primary.
    pub fn bootstrap_group_valid(&self) -> bool {
        match &self.topology {
            ClusterTopology::SingleMember {} => true,
            ClusterTopology::Group { members } => members
                .first()
                .map(|m| m.role == MemberRole::Primary && m.size > 0)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_spec(members: Vec<Member>) -> MySqlClusterSpec {
        MySqlClusterSpec {
            topology: ClusterTopology::Group { members },
            pod_template: PodTemplate {
                image: "mysql:8.0".to_string(),
                image_pull_policy: None,
                resources: None,
                env: None,
                readiness_probe: None,
                liveness_probe: None,
                storage: None,
            },
            update_strategy: None,
            service_type: None,
            proxy_enabled: None,
            metrics_enabled: None,
        }
    }

    #[test]
    fn replica_count_sums_role_groups() {
        let spec = group_spec(vec![
            Member {
                role: MemberRole::Primary,
                size: 3,
            },
            Member {
                role: MemberRole::Secondary,
                size: 2,
            },
        ]);
        assert_eq!(spec.replica_count(), 5);
        assert!(spec.cluster_mode());
        assert!(spec.bootstrap_group_valid());
    }

    #[test]
    fn bootstrap_group_must_be_primary() {
        let spec = group_spec(vec![Member {
            role: MemberRole::Secondary,
            size: 3,
        }]);
        assert!(!spec.bootstrap_group_valid());

        let empty = group_spec(vec![]);
        assert_eq!(empty.replica_count(), 0);
        assert!(!empty.bootstrap_group_valid());
    }

    #[test]
    fn status_changed_covers_every_field() {
        let base = MySqlClusterStatus {
            access_point: "10.0.0.1:3306".to_string(),
            size: 3,
            ready: 3,
            age: "2024-01-01".to_string(),
        };
        assert!(!base.changed(&base.clone()));

        let mut other = base.clone();
        other.access_point = "10.0.0.2:3306".to_string();
        assert!(base.changed(&other));

        let mut other = base.clone();
        other.size = 5;
        assert!(base.changed(&other));

        let mut other = base.clone();
        other.ready = 1;
        assert!(base.changed(&other));

        let mut other = base.clone();
        other.age = "2024-02-02".to_string();
        assert!(base.changed(&other));
    }

    #[test]
    fn topology_round_trips_with_mode_tag() {
        let spec = group_spec(vec![Member {
            role: MemberRole::Primary,
            size: 3,
        }]);
        let json = serde_json::to_value(&spec.topology).unwrap();
        assert_eq!(json["mode"], "group");
        let back: ClusterTopology = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ClusterTopology::Group { .. }));
    }
}
