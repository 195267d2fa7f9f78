//! Ordered cleanup of owned objects before the cluster can be deleted.
//!
//! The protective finalizer token stays on the object until every owned
//! resource is confirmed deleted or already absent; a failed deletion leaves
//! the token in place so the platform re-invokes finalization later.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use tracing::*;

use crate::common::*;
use crate::mysqlcluster_types::MySqlCluster;
use crate::Error;

/// Deletes storage, compute, network and config objects for every planned
/// ordinal, then removes the protective finalizer. Absence of any object is
/// success, so a repeated invocation after partial cleanup also succeeds.
pub async fn finalize(
    client: Client,
    cluster_api: &Api<MySqlCluster>,
    cluster: &MySqlCluster,
) -> Result<(), Error> {
    let has_token = cluster
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|t| t == FINALIZER_NAME))
        .unwrap_or(false);
    if !has_token {
        return Ok(());
    }

    let namespace = cluster_namespace(cluster);
    let size = cluster.spec.replica_count();
    info!(
        "Finalizing {}: deleting owned objects for {} members",
        cluster_name(cluster),
        size
    );

    let pvc_api = Api::<corev1::PersistentVolumeClaim>::namespaced(client.clone(), &namespace);
    for ordinal in 0..size {
        delete_tolerating_absence(&pvc_api, &pvc_name(cluster, ordinal)).await?;
    }

    let sts_api = Api::<appsv1::StatefulSet>::namespaced(client.clone(), &namespace);
    for ordinal in 0..size {
        delete_tolerating_absence(&sts_api, &stateful_set_name(cluster, ordinal)).await?;
    }

    let svc_api = Api::<corev1::Service>::namespaced(client.clone(), &namespace);
    delete_tolerating_absence(&svc_api, &headless_service_name(cluster)).await?;
    delete_tolerating_absence(&svc_api, &client_service_name(cluster)).await?;

    let cm_api = Api::<corev1::ConfigMap>::namespaced(client.clone(), &namespace);
    for ordinal in 0..size {
        delete_tolerating_absence(&cm_api, &config_map_name(cluster, ordinal)).await?;
    }

    let secret_api = Api::<corev1::Secret>::namespaced(client.clone(), &namespace);
    delete_tolerating_absence(&secret_api, &secret_name(cluster)).await?;

    remove_finalizer(cluster_api, cluster).await
}

async fn delete_tolerating_absence<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!("Deleted {}", name);
            Ok(())
        }
        Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
            if reason == "NotFound" =>
        {
            Ok(())
        }
        Err(e) => Err(Error::FinalizeFailed(e)),
    }
}

async fn remove_finalizer(
    cluster_api: &Api<MySqlCluster>,
    cluster: &MySqlCluster,
) -> Result<(), Error> {
    let remaining: Vec<String> = cluster
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|token| token != FINALIZER_NAME)
        .collect();
    cluster_api
        .patch(
            &cluster_name(cluster),
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "finalizers": remaining } })),
        )
        .await
        .map_err(Error::CRUpdateFailed)?;
    info!("Removed finalizer from {}", cluster_name(cluster));
    Ok(())
}
