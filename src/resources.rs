//! Builders for the platform objects owned by a cluster.
//!
//! Every object carries a controller owner reference so that platform
//! garbage collection backstops explicit finalization.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, Resource};
use std::collections::BTreeMap;

use crate::common::*;
use crate::config;
use crate::mysqlcluster_types::*;
use crate::topology::{parse_memory_quantity, MemberIdentity};

fn cluster_labels(cluster: &MySqlCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), cluster_name(cluster)),
        (LABEL_INSTANCE.to_string(), cluster_name(cluster)),
    ])
}

fn member_labels(cluster: &MySqlCluster, ordinal: i32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), cluster_name(cluster)),
        (
            LABEL_INSTANCE.to_string(),
            stateful_set_name(cluster, ordinal),
        ),
    ])
}

pub fn make_credentials_secret(cluster: &MySqlCluster) -> corev1::Secret {
    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    if let Some(envs) = cluster.spec.pod_template.env.as_ref() {
        for env in envs {
            if let Some(value) = env.value.as_ref() {
                data.insert(env.name.clone(), ByteString(value.clone().into_bytes()));
            }
        }
    }
    data.entry(ROOT_PASSWORD_KEY.to_string())
        .or_insert_with(|| ByteString(root_password(cluster).into_bytes()));

    corev1::Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(cluster)),
            namespace: cluster.metadata.namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(cluster_labels(cluster)),
            ..ObjectMeta::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..corev1::Secret::default()
    }
}

/// Buffer-pool sizing from the template's memory request; falls back to the
/// packaged default when no parsable request is declared.
pub fn buffer_pool_size(cluster: &MySqlCluster) -> String {
    cluster
        .spec
        .pod_template
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("memory"))
        .and_then(|quantity| parse_memory_quantity(&quantity.0))
        .map(config::innodb_buffer_pool_size)
        .unwrap_or_else(|| config::DEFAULT_BUFFER_POOL_SIZE.to_string())
}

pub fn make_member_config_map(
    cluster: &MySqlCluster,
    member: &MemberIdentity,
    group_name: &str,
) -> corev1::ConfigMap {
    let cnf = config::MySqlConfig {
        server_id: member.server_id.to_string(),
        enable_cluster: cluster.spec.cluster_mode(),
        group_name: group_name.to_string(),
        local_address: member.local_address(),
        group_seeds: member.seeds.join(","),
        report_host: member.host.clone(),
        report_port: member.report_port,
        innodb_buffer_pool_size: buffer_pool_size(cluster),
    };

    corev1::ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(cluster, member.ordinal)),
            namespace: cluster.metadata.namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(member_labels(cluster, member.ordinal)),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), cnf.render())])),
        ..corev1::ConfigMap::default()
    }
}

pub fn make_member_pvc(cluster: &MySqlCluster, ordinal: i32) -> corev1::PersistentVolumeClaim {
    let storage = cluster.spec.pod_template.storage.as_ref();
    let requested = storage
        .and_then(|s| s.request.as_ref())
        .filter(|quantity| parse_memory_quantity(&quantity.0).map_or(false, |bytes| bytes > 0))
        .cloned()
        // absent or non-positive requests get the packaged minimum
        .unwrap_or_else(|| Quantity("5Gi".to_string()));

    corev1::PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(cluster, ordinal)),
            namespace: cluster.metadata.namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(member_labels(cluster, ordinal)),
            ..ObjectMeta::default()
        },
        spec: Some(corev1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(corev1::ResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), requested)])),
                ..corev1::ResourceRequirements::default()
            }),
            storage_class_name: storage.and_then(|s| s.storage_class.clone()),
            volume_mode: Some("Filesystem".to_string()),
            ..corev1::PersistentVolumeClaimSpec::default()
        }),
        ..corev1::PersistentVolumeClaim::default()
    }
}

pub fn make_member_statefulset(
    cluster: &MySqlCluster,
    member: &MemberIdentity,
) -> appsv1::StatefulSet {
    appsv1::StatefulSet {
        metadata: ObjectMeta {
            name: Some(stateful_set_name(cluster, member.ordinal)),
            namespace: cluster.metadata.namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(member_labels(cluster, member.ordinal)),
            ..ObjectMeta::default()
        },
        spec: Some(appsv1::StatefulSetSpec {
            replicas: Some(1),
            service_name: headless_service_name(cluster),
            selector: metav1::LabelSelector {
                match_labels: Some(member_labels(cluster, member.ordinal)),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(member_labels(cluster, member.ordinal)),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(make_member_pod_spec(cluster, member)),
            },
            update_strategy: make_update_strategy(cluster),
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    }
}

fn make_update_strategy(cluster: &MySqlCluster) -> Option<appsv1::StatefulSetUpdateStrategy> {
    cluster
        .spec
        .update_strategy
        .as_ref()
        .map(|strategy| appsv1::StatefulSetUpdateStrategy {
            type_: strategy.strategy_type.clone(),
            rolling_update: strategy.partition.map(|partition| {
                appsv1::RollingUpdateStatefulSetStrategy {
                    partition: Some(partition),
                    ..appsv1::RollingUpdateStatefulSetStrategy::default()
                }
            }),
        })
}

fn make_member_pod_spec(cluster: &MySqlCluster, member: &MemberIdentity) -> corev1::PodSpec {
    let template = &cluster.spec.pod_template;
    corev1::PodSpec {
        containers: vec![corev1::Container {
            name: "mysql".to_string(),
            image: Some(template.image.clone()),
            image_pull_policy: template.image_pull_policy.clone(),
            env: template.env.clone(),
            env_from: Some(vec![corev1::EnvFromSource {
                secret_ref: Some(corev1::SecretEnvSource {
                    name: Some(secret_name(cluster)),
                    ..corev1::SecretEnvSource::default()
                }),
                ..corev1::EnvFromSource::default()
            }]),
            resources: template.resources.clone(),
            readiness_probe: template.readiness_probe.clone(),
            liveness_probe: template.liveness_probe.clone(),
            ports: Some(vec![
                corev1::ContainerPort {
                    name: Some(MYSQL_PORT_NAME.to_string()),
                    container_port: MYSQL_PORT,
                    ..corev1::ContainerPort::default()
                },
                corev1::ContainerPort {
                    name: Some(GROUP_COMM_PORT_NAME.to_string()),
                    container_port: GROUP_COMM_PORT,
                    ..corev1::ContainerPort::default()
                },
                corev1::ContainerPort {
                    name: Some(ADMIN_PORT_NAME.to_string()),
                    container_port: ADMIN_PORT,
                    ..corev1::ContainerPort::default()
                },
            ]),
            volume_mounts: Some(vec![
                corev1::VolumeMount {
                    name: "data".to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..corev1::VolumeMount::default()
                },
                corev1::VolumeMount {
                    name: "conf".to_string(),
                    mount_path: format!("/etc/{}", CONFIG_FILE),
                    sub_path: Some(CONFIG_FILE.to_string()),
                    ..corev1::VolumeMount::default()
                },
            ]),
            ..corev1::Container::default()
        }],
        volumes: Some(vec![
            corev1::Volume {
                name: "conf".to_string(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: Some(config_map_name(cluster, member.ordinal)),
                    ..corev1::ConfigMapVolumeSource::default()
                }),
                ..corev1::Volume::default()
            },
            corev1::Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(cluster, member.ordinal),
                    ..corev1::PersistentVolumeClaimVolumeSource::default()
                }),
                ..corev1::Volume::default()
            },
        ]),
        ..corev1::PodSpec::default()
    }
}

pub fn make_headless_service(cluster: &MySqlCluster) -> corev1::Service {
    make_service(
        cluster,
        headless_service_name(cluster),
        vec![
            corev1::ServicePort {
                name: Some(MYSQL_PORT_NAME.to_string()),
                port: MYSQL_PORT,
                ..corev1::ServicePort::default()
            },
            corev1::ServicePort {
                name: Some(GROUP_COMM_PORT_NAME.to_string()),
                port: GROUP_COMM_PORT,
                ..corev1::ServicePort::default()
            },
            corev1::ServicePort {
                name: Some(ADMIN_PORT_NAME.to_string()),
                port: ADMIN_PORT,
                ..corev1::ServicePort::default()
            },
        ],
        true,
    )
}

pub fn make_client_service(cluster: &MySqlCluster) -> corev1::Service {
    make_service(
        cluster,
        client_service_name(cluster),
        vec![corev1::ServicePort {
            name: Some(MYSQL_PORT_NAME.to_string()),
            port: MYSQL_PORT,
            ..corev1::ServicePort::default()
        }],
        false,
    )
}

fn make_service(
    cluster: &MySqlCluster,
    name: String,
    ports: Vec<corev1::ServicePort>,
    headless: bool,
) -> corev1::Service {
    corev1::Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.metadata.namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(cluster_labels(cluster)),
            ..ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            cluster_ip: if headless {
                Some("None".to_string())
            } else {
                None
            },
            type_: if headless {
                None
            } else {
                cluster.spec.service_type.clone()
            },
            ports: Some(ports),
            // member pods of every ordinal share the name label
            selector: Some(BTreeMap::from([(
                LABEL_NAME.to_string(),
                cluster_name(cluster),
            )])),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology;

    fn test_cluster() -> MySqlCluster {
        let spec = MySqlClusterSpec {
            topology: ClusterTopology::Group {
                members: vec![Member {
                    role: MemberRole::Primary,
                    size: 3,
                }],
            },
            pod_template: PodTemplate {
                image: "mysql:8.0".to_string(),
                image_pull_policy: Some("IfNotPresent".to_string()),
                resources: Some(corev1::ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "memory".to_string(),
                        Quantity("1Gi".to_string()),
                    )])),
                    ..corev1::ResourceRequirements::default()
                }),
                env: None,
                readiness_probe: None,
                liveness_probe: None,
                storage: None,
            },
            update_strategy: None,
            service_type: None,
            proxy_enabled: None,
            metrics_enabled: None,
        };
        let mut cluster = MySqlCluster::new("db", spec);
        cluster.metadata.namespace = Some("prod".to_string());
        cluster.metadata.uid = Some("3c2a0a9e-test-uid".to_string());
        cluster
    }

    #[test]
    fn owned_objects_carry_owner_references() {
        let cluster = test_cluster();
        let members = topology::plan("db", "prod", 3);

        let secret = make_credentials_secret(&cluster);
        let cm = make_member_config_map(&cluster, &members[0], "group-uuid");
        let pvc = make_member_pvc(&cluster, 0);
        let sts = make_member_statefulset(&cluster, &members[0]);
        let svc = make_headless_service(&cluster);

        for owner_refs in [
            secret.metadata.owner_references,
            cm.metadata.owner_references,
            pvc.metadata.owner_references,
            sts.metadata.owner_references,
            svc.metadata.owner_references,
        ] {
            let owner = &owner_refs.unwrap()[0];
            assert_eq!(owner.kind, "MySqlCluster");
            assert_eq!(owner.name, "db");
            assert_eq!(owner.controller, Some(true));
        }
    }

    #[test]
    fn config_map_renders_the_member_identity() {
        let cluster = test_cluster();
        let members = topology::plan("db", "prod", 3);
        let cm = make_member_config_map(&cluster, &members[1], "group-uuid");

        assert_eq!(cm.metadata.name.as_deref(), Some("db-config-1"));
        let cnf = &cm.data.unwrap()[CONFIG_FILE];
        assert!(cnf.contains("server_id=1\n"));
        assert!(cnf.contains("loose-group_replication_group_name=\"group-uuid\"\n"));
        assert!(cnf.contains(
            "loose-group_replication_local_address=\
             \"db-1-0.db-headless.prod.svc.cluster.local:33061\"\n"
        ));
        // 75% of 1Gi
        assert!(cnf.contains("innodb_buffer_pool_size=768M\n"));
        // seeds list every planned member
        assert!(cnf.contains("db-0-0.db-headless.prod.svc.cluster.local:33061"));
        assert!(cnf.contains("db-2-0.db-headless.prod.svc.cluster.local:33061"));
    }

    #[test]
    fn pvc_defaults_missing_storage_to_the_minimum() {
        let cluster = test_cluster();
        let pvc = make_member_pvc(&cluster, 2);
        assert_eq!(pvc.metadata.name.as_deref(), Some("db-db-2"));
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("5Gi".to_string()));
    }

    #[test]
    fn pvc_rejects_non_positive_storage() {
        let mut cluster = test_cluster();
        cluster.spec.pod_template.storage = Some(StorageSpec {
            request: Some(Quantity("0".to_string())),
            storage_class: Some("fast".to_string()),
        });
        let pvc = make_member_pvc(&cluster, 0);
        let spec = pvc.spec.unwrap();
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("5Gi".to_string())
        );
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
    }

    #[test]
    fn statefulset_is_single_replica_per_member() {
        let cluster = test_cluster();
        let members = topology::plan("db", "prod", 3);
        let sts = make_member_statefulset(&cluster, &members[2]);

        assert_eq!(sts.metadata.name.as_deref(), Some("db-2"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name, "db-headless");

        let pod = spec.template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.config_map.as_ref().and_then(|c| c.name.as_deref())
                == Some("db-config-2")));
        assert!(volumes.iter().any(|v| v
            .persistent_volume_claim
            .as_ref()
            .map(|c| c.claim_name.as_str())
            == Some("db-db-2")));
    }

    #[test]
    fn services_split_headless_and_client() {
        let mut cluster = test_cluster();
        cluster.spec.service_type = Some("NodePort".to_string());

        let headless = make_headless_service(&cluster);
        assert_eq!(headless.metadata.name.as_deref(), Some("db-headless"));
        let headless_spec = headless.spec.unwrap();
        assert_eq!(headless_spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(headless_spec.ports.unwrap().len(), 3);

        let client = make_client_service(&cluster);
        assert_eq!(client.metadata.name.as_deref(), Some("db"));
        let client_spec = client.spec.unwrap();
        assert_eq!(client_spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(client_spec.cluster_ip, None);
    }
}
