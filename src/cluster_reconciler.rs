//! One reconciliation pass for a cluster object.
//!
//! The pass converges platform objects first (create-if-absent, in
//! dependency order), then drives replication formation member by member in
//! ordinal order. Any failure aborts the pass; the controller retries the
//! whole pass, so every step re-verifies already-applied state instead of
//! checkpointing.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::{
    api::{Api, Patch, PatchParams, PostParams, Resource},
    runtime::controller::Action,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

use crate::common::*;
use crate::finalizer;
use crate::gtid;
use crate::mysql::MySqlMember;
use crate::mysqlcluster_types::*;
use crate::resources::*;
use crate::topology::{self, MemberIdentity};
use crate::{Data, Error};

/// Controller entry point, invoked on object change or periodic resync.
pub async fn reconcile(cluster_from_cache: Arc<MySqlCluster>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = cluster_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?
        .clone();
    let namespace = cluster_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?
        .clone();

    let cluster_api = Api::<MySqlCluster>::namespaced(client.clone(), &namespace);

    // Read back the fresh object before acting on the cached one.
    let get_result = cluster_api.get(&name).await;
    match get_result {
        Err(kube_client::error::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
            if reason == "NotFound" =>
        {
            info!("{} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
        _ => {}
    }
    let cluster = get_result.unwrap();

    if cluster.metadata.deletion_timestamp.is_some() {
        finalizer::finalize(client.clone(), &cluster_api, &cluster).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&cluster_api, &cluster).await?;

    if !cluster.spec.bootstrap_group_valid() {
        warn!(
            "{}: the first role group must be primary with size > 0, skipping",
            name
        );
        return Ok(Action::await_change());
    }

    let group_name = ensure_group_name(&cluster_api, &cluster).await?;
    let members = topology::plan(&name, &namespace, cluster.spec.replica_count());

    // An existing ordinal-0 workload means the cluster was already created;
    // objects are never diffed against their desired shape after that.
    let sts_api = Api::<appsv1::StatefulSet>::namespaced(client.clone(), &namespace);
    let first_workload = sts_api
        .get_opt(&stateful_set_name(&cluster, 0))
        .await
        .map_err(Error::ReconcileStatefulSetFailed)?;
    if first_workload.is_none() {
        create_cluster_resources(client, &cluster, &members, &group_name).await?;
    }

    if cluster.spec.cluster_mode() {
        form_replication_group(client, &cluster, &members).await?;
    }

    update_status(client, &cluster_api, &cluster, &members).await?;

    Ok(Action::requeue(Duration::from_secs(60)))
}

async fn ensure_finalizer(api: &Api<MySqlCluster>, cluster: &MySqlCluster) -> Result<(), Error> {
    let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER_NAME) {
        return Ok(());
    }
    finalizers.push(FINALIZER_NAME.to_string());
    api.patch(
        &cluster_name(cluster),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await
    .map_err(Error::CRUpdateFailed)?;
    Ok(())
}

/// The replication group name is generated once per cluster lifetime and
/// persisted on the object; rejoining members must agree on it across
/// passes, so it is never recomputed.
async fn ensure_group_name(
    api: &Api<MySqlCluster>,
    cluster: &MySqlCluster,
) -> Result<String, Error> {
    if let Some(existing) = cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GROUP_NAME_ANNOTATION))
    {
        return Ok(existing.clone());
    }

    let group_name = uuid::Uuid::new_v4().to_string();
    info!(
        "Assigning replication group name {} to {}",
        group_name,
        cluster_name(cluster)
    );
    api.patch(
        &cluster_name(cluster),
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": { "annotations": { GROUP_NAME_ANNOTATION: group_name } }
        })),
    )
    .await
    .map_err(Error::CRUpdateFailed)?;
    Ok(group_name)
}

/// First-time creation: config, storage and compute for every member in
/// ordinal order, then the services.
async fn create_cluster_resources(
    client: &Client,
    cluster: &MySqlCluster,
    members: &[MemberIdentity],
    group_name: &str,
) -> Result<(), Error> {
    ensure_secret(client, cluster).await?;
    for member in members {
        ensure_member_config_map(client, cluster, member, group_name).await?;
        ensure_member_pvc(client, cluster, member.ordinal).await?;
        ensure_member_statefulset(client, cluster, member).await?;
    }
    ensure_services(client, cluster).await?;
    Ok(())
}

async fn ensure_secret(client: &Client, cluster: &MySqlCluster) -> Result<(), Error> {
    let secret_api =
        Api::<corev1::Secret>::namespaced(client.clone(), &cluster_namespace(cluster));
    let secret = make_credentials_secret(cluster);
    info!("Create secret: {}", secret.metadata.name.as_ref().unwrap());
    match secret_api.create(&PostParams::default(), &secret).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason == "AlreadyExists" =>
            {
                Ok(())
            }
            _ => Err(Error::ReconcileSecretFailed(e)),
        },
        _ => Ok(()),
    }
}

async fn ensure_member_config_map(
    client: &Client,
    cluster: &MySqlCluster,
    member: &MemberIdentity,
    group_name: &str,
) -> Result<(), Error> {
    let cm_api =
        Api::<corev1::ConfigMap>::namespaced(client.clone(), &cluster_namespace(cluster));
    let cm = make_member_config_map(cluster, member, group_name);
    info!("Create configmap: {}", cm.metadata.name.as_ref().unwrap());
    match cm_api.create(&PostParams::default(), &cm).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason == "AlreadyExists" =>
            {
                Ok(())
            }
            _ => Err(Error::ReconcileConfigMapFailed(e)),
        },
        _ => Ok(()),
    }
}

async fn ensure_member_pvc(
    client: &Client,
    cluster: &MySqlCluster,
    ordinal: i32,
) -> Result<(), Error> {
    let pvc_api = Api::<corev1::PersistentVolumeClaim>::namespaced(
        client.clone(),
        &cluster_namespace(cluster),
    );
    let pvc = make_member_pvc(cluster, ordinal);
    info!(
        "Create persistentvolumeclaim: {}",
        pvc.metadata.name.as_ref().unwrap()
    );
    match pvc_api.create(&PostParams::default(), &pvc).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason == "AlreadyExists" =>
            {
                Ok(())
            }
            _ => Err(Error::ReconcilePvcFailed(e)),
        },
        _ => Ok(()),
    }
}

async fn ensure_member_statefulset(
    client: &Client,
    cluster: &MySqlCluster,
    member: &MemberIdentity,
) -> Result<(), Error> {
    let sts_api =
        Api::<appsv1::StatefulSet>::namespaced(client.clone(), &cluster_namespace(cluster));
    let sts = make_member_statefulset(cluster, member);
    info!(
        "Create statefulset: {}",
        sts.metadata.name.as_ref().unwrap()
    );
    match sts_api.create(&PostParams::default(), &sts).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason == "AlreadyExists" =>
            {
                Ok(())
            }
            _ => Err(Error::ReconcileStatefulSetFailed(e)),
        },
        _ => Ok(()),
    }
}

async fn ensure_services(client: &Client, cluster: &MySqlCluster) -> Result<(), Error> {
    let svc_api =
        Api::<corev1::Service>::namespaced(client.clone(), &cluster_namespace(cluster));
    for service in [make_headless_service(cluster), make_client_service(cluster)] {
        info!("Create service: {}", service.metadata.name.as_ref().unwrap());
        match svc_api.create(&PostParams::default(), &service).await {
            Err(e) => match e {
                kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                    if reason == "AlreadyExists" => {}
                _ => return Err(Error::ReconcileServiceFailed(e)),
            },
            _ => {}
        }
    }
    Ok(())
}

/// Orders formation so the bootstrap member always goes first, with the
/// remaining members following in ordinal order.
pub fn formation_order(member_count: usize, bootstrap_ordinal: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(member_count);
    if bootstrap_ordinal < member_count {
        order.push(bootstrap_ordinal);
    }
    order.extend((0..member_count).filter(|i| *i != bootstrap_ordinal));
    order
}

/// Converges engine-level replication state. Members already reporting
/// group membership are skipped, which makes the whole step idempotent
/// across passes.
async fn form_replication_group(
    client: &Client,
    cluster: &MySqlCluster,
    members: &[MemberIdentity],
) -> Result<(), Error> {
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "mysql-controller".to_string(),
            instance: None,
        },
        cluster.object_ref(&()),
    );

    let root_password = root_password(cluster);
    let drivers: Vec<MySqlMember> = members
        .iter()
        .map(|m| MySqlMember::new(m.host.clone(), ROOT_USER.to_string(), root_password.clone()))
        .collect();

    // Watermark collection is best effort: an unreachable or fresh member
    // simply reports "not yet initialized".
    let mut watermarks = Vec::with_capacity(drivers.len());
    for driver in &drivers {
        let raw = match driver.gtid_executed().await {
            Ok(gtid) if !gtid.is_empty() => gtid,
            Ok(_) => "0".to_string(),
            Err(e) => {
                debug!("{}: no usable watermark: {}", driver.host, e);
                "0".to_string()
            }
        };
        watermarks.push(raw);
    }

    // The most advanced member is the only safe bootstrap source; a fresh
    // cluster reports nothing usable and defaults to ordinal 0.
    let bootstrap_ordinal = match gtid::max_gtid_member(&watermarks) {
        Ok(Some(max)) => max.server_id,
        Ok(None) => 0,
        Err(e) => {
            warn!(
                "{}: unusable watermark, abandoning formation this pass: {}",
                cluster_name(cluster),
                e
            );
            publish_event(
                &recorder,
                EventType::Warning,
                "UnusableWatermark",
                &e.to_string(),
            )
            .await;
            return Ok(());
        }
    };

    for idx in formation_order(members.len(), bootstrap_ordinal) {
        let member = &members[idx];
        let driver = &drivers[idx];

        if driver
            .cluster_exists()
            .await
            .map_err(Error::ReplicationFailed)?
        {
            publish_event(
                &recorder,
                EventType::Normal,
                "ClusterExists",
                &format!("{} already reports group membership", member.host),
            )
            .await;
            continue;
        }

        publish_event(
            &recorder,
            EventType::Normal,
            "Initializing",
            &format!("Setting up replication on {}", member.host),
        )
        .await;

        driver
            .ensure_replication_user(REPLICATION_USER, &replication_password())
            .await
            .map_err(Error::ReplicationFailed)?;
        driver
            .grant_replication_privileges(REPLICATION_USER)
            .await
            .map_err(Error::ReplicationFailed)?;

        if idx == bootstrap_ordinal {
            driver
                .set_recovery_channel(REPLICATION_USER, &replication_password())
                .await
                .map_err(Error::ReplicationFailed)?;
            driver.bootstrap().await.map_err(Error::ReplicationFailed)?;
        } else {
            driver.join().await.map_err(Error::ReplicationFailed)?;
        }
    }

    Ok(())
}

async fn publish_event(recorder: &Recorder, type_: EventType, reason: &str, note: &str) {
    let result = recorder
        .publish(Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        })
        .await;
    if let Err(e) = result {
        warn!("Failed to publish event {}: {}", reason, e);
    }
}

/// Writes observed state once per successful pass, skipped when nothing
/// changed to avoid update churn.
async fn update_status(
    client: &Client,
    cluster_api: &Api<MySqlCluster>,
    cluster: &MySqlCluster,
    members: &[MemberIdentity],
) -> Result<(), Error> {
    let svc_api =
        Api::<corev1::Service>::namespaced(client.clone(), &cluster_namespace(cluster));
    let service = match svc_api
        .get_opt(&client_service_name(cluster))
        .await
        .map_err(Error::ReconcileServiceFailed)?
    {
        Some(service) => service,
        None => return Ok(()),
    };

    let sts_api =
        Api::<appsv1::StatefulSet>::namespaced(client.clone(), &cluster_namespace(cluster));
    let mut ready = 0;
    for member in members {
        if let Some(sts) = sts_api
            .get_opt(&stateful_set_name(cluster, member.ordinal))
            .await
            .map_err(Error::ReconcileStatefulSetFailed)?
        {
            ready += sts.status.and_then(|s| s.ready_replicas).unwrap_or(0);
        }
    }

    let status = MySqlClusterStatus {
        access_point: service_access_point(&service),
        size: members.len() as i32,
        ready,
        age: service
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339())
            .unwrap_or_default(),
    };

    let current = cluster.status.clone().unwrap_or_default();
    if !status.changed(&current) {
        return Ok(());
    }

    cluster_api
        .patch_status(
            &cluster_name(cluster),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .map_err(Error::StatusUpdateFailed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::formation_order;

    #[test]
    fn bootstrap_member_always_forms_first() {
        assert_eq!(formation_order(3, 0), vec![0, 1, 2]);
        assert_eq!(formation_order(3, 2), vec![2, 0, 1]);
        assert_eq!(formation_order(1, 0), vec![0]);
    }

    #[test]
    fn out_of_range_bootstrap_falls_back_to_ordinal_order() {
        assert_eq!(formation_order(3, 7), vec![0, 1, 2]);
        assert!(formation_order(0, 0).is_empty());
    }
}
