pub mod cluster_reconciler;
pub mod common;
pub mod config;
pub mod finalizer;
pub mod gtid;
pub mod mysql;
pub mod mysqlcluster_types;
pub mod resources;
pub mod topology;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::controller::{Action, Controller},
    Client, CustomResourceExt,
};
use std::{env, sync::Arc};
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::mysql::MySqlError;
use crate::mysqlcluster_types::MySqlCluster;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get CR: {0}")]
    CRGetFailed(#[source] kube::Error),
    #[error("Failed to update CR metadata: {0}")]
    CRUpdateFailed(#[source] kube::Error),
    #[error("Failed to reconcile Secret: {0}")]
    ReconcileSecretFailed(#[source] kube::Error),
    #[error("Failed to reconcile ConfigMap: {0}")]
    ReconcileConfigMapFailed(#[source] kube::Error),
    #[error("Failed to reconcile PersistentVolumeClaim: {0}")]
    ReconcilePvcFailed(#[source] kube::Error),
    #[error("Failed to reconcile StatefulSet: {0}")]
    ReconcileStatefulSetFailed(#[source] kube::Error),
    #[error("Failed to reconcile Service: {0}")]
    ReconcileServiceFailed(#[source] kube::Error),
    #[error("Failed to update status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to finalize cluster: {0}")]
    FinalizeFailed(#[source] kube::Error),
    #[error("Replication setup failed: {0}")]
    ReplicationFailed(#[source] MySqlError),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

// Data we want access to in error/reconcile calls
pub struct Data {
    pub client: Client,
}

/// The controller triggers this on reconcile errors
fn error_policy(_object: Arc<MySqlCluster>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&MySqlCluster::crd())?);
    } else if cmd == String::from("run") {
        info!("running mysql-controller");
        let client = Client::try_default().await?;
        let clusters = Api::<MySqlCluster>::all(client.clone());

        Controller::new(clusters, ListParams::default())
            .shutdown_on_signal()
            .run(
                cluster_reconciler::reconcile,
                error_policy,
                Arc::new(Data { client }),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
