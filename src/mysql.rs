//! Engine-level replication setup against one member's SQL endpoint.
//!
//! Each operation opens its own session and is safe to repeat: existence is
//! checked before creation, and bootstrap refuses members that already
//! report group membership. The per-member progression is
//! unprovisioned -> user provisioned -> bootstrapped or joined -> in group,
//! re-entered from the last reached state on retry.

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use thiserror::Error;
use tokio::time::{timeout, Duration};

use crate::common::{MYSQL_DB, MYSQL_PORT};

// A hung member must not block the whole cluster's convergence.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MySqlError {
    #[error("mysql transport error: {0}")]
    Transport(#[from] mysql_async::Error),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("replication protocol error: {0}")]
    Protocol(String),
}

/// One member's SQL endpoint.
#[derive(Debug, Clone)]
pub struct MySqlMember {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
}

impl MySqlMember {
    pub fn new(host: String, user: String, password: String) -> Self {
        MySqlMember {
            host,
            port: MYSQL_PORT as u16,
            user,
            password,
            db: MYSQL_DB.to_string(),
        }
    }

    async fn connect(&self) -> Result<Conn, MySqlError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.db.clone()));
        let conn = timeout(CONNECT_TIMEOUT, Conn::new(Opts::from(opts)))
            .await
            .map_err(|_| MySqlError::Timeout(self.host.clone()))??;
        Ok(conn)
    }

    /// Creates the replication account unless it already exists.
    pub async fn ensure_replication_user(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(), MySqlError> {
        let mut conn = self.connect().await?;
        let count: Option<i64> = conn
            .exec_first("SELECT COUNT(*) FROM mysql.user WHERE user = ?", (user,))
            .await?;
        if count.unwrap_or(0) == 0 {
            conn.exec_drop("CREATE USER ?@'%' IDENTIFIED BY ?", (user, password))
                .await?;
        }
        conn.disconnect().await?;
        Ok(())
    }

    /// Grants exactly the privileges replication recovery and backup
    /// coordination need, nothing broader.
    pub async fn grant_replication_privileges(&self, user: &str) -> Result<(), MySqlError> {
        let mut conn = self.connect().await?;
        conn.exec_drop(
            "GRANT BACKUP_ADMIN, REPLICATION SLAVE ON *.* TO ?@'%'",
            (user,),
        )
        .await?;
        conn.disconnect().await?;
        Ok(())
    }

    /// Points the distributed-recovery channel at the replication account.
    pub async fn set_recovery_channel(&self, user: &str, password: &str) -> Result<(), MySqlError> {
        let mut conn = self.connect().await?;
        conn.exec_drop(
            "CHANGE REPLICATION SOURCE TO SOURCE_USER = ?, SOURCE_PASSWORD = ? \
             FOR CHANNEL 'group_replication_recovery'",
            (user, password),
        )
        .await?;
        conn.disconnect().await?;
        Ok(())
    }

    /// Whether this member already reports ONLINE group membership.
    pub async fn cluster_exists(&self) -> Result<bool, MySqlError> {
        let mut conn = self.connect().await?;
        let online: Option<i64> = conn
            .query_first(
                "SELECT COUNT(*) FROM performance_schema.replication_group_members \
                 WHERE MEMBER_STATE = 'ONLINE'",
            )
            .await?;
        conn.disconnect().await?;
        Ok(online.unwrap_or(0) > 0)
    }

    /// Creates a new replication group from this member. Exactly one live
    /// member may ever run this; a member already in a group is refused.
    pub async fn bootstrap(&self) -> Result<(), MySqlError> {
        if self.cluster_exists().await? {
            return Err(MySqlError::Protocol(format!(
                "{} already reports group membership, refusing to bootstrap",
                self.host
            )));
        }
        let mut conn = self.connect().await?;
        conn.query_drop("SET GLOBAL group_replication_bootstrap_group = ON")
            .await?;
        conn.query_drop("START GROUP_REPLICATION").await?;
        conn.query_drop("SET GLOBAL group_replication_bootstrap_group = OFF")
            .await?;
        conn.disconnect().await?;
        Ok(())
    }

    /// Attaches to the existing group through the seeds rendered into this
    /// member's configuration.
    pub async fn join(&self) -> Result<(), MySqlError> {
        let mut conn = self.connect().await?;
        conn.query_drop("START GROUP_REPLICATION").await?;
        conn.disconnect().await?;
        Ok(())
    }

    /// The member's raw executed-GTID watermark.
    pub async fn gtid_executed(&self) -> Result<String, MySqlError> {
        let mut conn = self.connect().await?;
        let gtid: Option<String> = conn.query_first("SELECT @@global.gtid_executed").await?;
        conn.disconnect().await?;
        Ok(gtid.unwrap_or_default())
    }
}
