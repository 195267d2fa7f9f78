//! Rendering of the per-member engine configuration file.

use crate::common::DATA_DIR;

/// Inputs for one member's `my.cnf`. Rendering is pure: identical inputs
/// produce byte-identical output.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub server_id: String,
    pub enable_cluster: bool,
    pub group_name: String,
    pub local_address: String,
    pub group_seeds: String,
    pub report_host: String,
    pub report_port: i32,
    pub innodb_buffer_pool_size: String,
}

impl MySqlConfig {
    pub fn render(&self) -> String {
        let mut cnf = format!(
            "[mysqld]\n\
            user=mysql\n\
            server_id={server_id}\n\
            datadir={data_dir}\n\
            socket={data_dir}/mysql.sock\n\
            pid-file={data_dir}/mysql.pid\n\
            log-error={data_dir}/error.log\n\
            innodb_buffer_pool_size={buffer_pool}\n\
            gtid_mode=ON\n\
            enforce_gtid_consistency=ON\n\
            binlog_format=ROW\n\
            binlog_checksum=NONE\n\
            log_bin=binlog\n\
            log_slave_updates=ON\n\
            report_host={report_host}\n\
            report_port={report_port}\n",
            server_id = self.server_id,
            data_dir = DATA_DIR,
            buffer_pool = self.innodb_buffer_pool_size,
            report_host = self.report_host,
            report_port = self.report_port,
        );

        if self.enable_cluster {
            cnf.push_str(&format!(
                "loose-plugin_load_add='group_replication.so'\n\
                loose-group_replication_group_name=\"{group_name}\"\n\
                loose-group_replication_start_on_boot=OFF\n\
                loose-group_replication_local_address=\"{local_address}\"\n\
                loose-group_replication_group_seeds=\"{group_seeds}\"\n\
                loose-group_replication_bootstrap_group=OFF\n",
                group_name = self.group_name,
                local_address = self.local_address,
                group_seeds = self.group_seeds,
            ));
        }

        cnf
    }
}

/// Buffer pool gets 75% of the member's memory allotment, floored to whole
/// mebibytes.
pub fn innodb_buffer_pool_size(memory_bytes: i64) -> String {
    let pool = memory_bytes * 75 / 100;
    format!("{}M", pool / (1024 * 1024))
}

/// Fallback when the template declares no parsable memory request.
pub const DEFAULT_BUFFER_POOL_SIZE: &str = "1G";

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_config() -> MySqlConfig {
        MySqlConfig {
            server_id: "1".to_string(),
            enable_cluster: true,
            group_name: "0b2c3d4e-0000-4000-8000-000000000001".to_string(),
            local_address: "db-1-0.db-headless.default.svc.cluster.local:33061".to_string(),
            group_seeds: "db-0-0.db-headless.default.svc.cluster.local:33061,\
                db-1-0.db-headless.default.svc.cluster.local:33061"
                .to_string(),
            report_host: "db-1-0.db-headless.default.svc.cluster.local".to_string(),
            report_port: 3306,
            innodb_buffer_pool_size: "768M".to_string(),
        }
    }

    #[test]
    fn render_is_deterministic() {
        let config = cluster_config();
        assert_eq!(config.render(), config.render());
    }

    #[test]
    fn cluster_mode_adds_the_group_replication_block() {
        let config = cluster_config();
        let rendered = config.render();
        assert!(rendered.contains("server_id=1\n"));
        assert!(rendered.contains(
            "loose-group_replication_group_name=\"0b2c3d4e-0000-4000-8000-000000000001\"\n"
        ));
        assert!(rendered.contains("loose-group_replication_bootstrap_group=OFF\n"));
        assert!(rendered.contains("report_port=3306\n"));
    }

    #[test]
    fn single_member_mode_omits_the_group_replication_block() {
        let config = MySqlConfig {
            enable_cluster: false,
            ..cluster_config()
        };
        let rendered = config.render();
        assert!(!rendered.contains("group_replication"));
        assert!(rendered.contains("gtid_mode=ON\n"));
    }

    #[test]
    fn buffer_pool_is_75_percent_floored_to_mebibytes() {
        assert_eq!(innodb_buffer_pool_size(1024 * 1024 * 1024), "768M");
        assert_eq!(innodb_buffer_pool_size(512 * 1024 * 1024), "384M");
        // floors instead of rounding
        assert_eq!(innodb_buffer_pool_size(100 * 1024 * 1024), "75M");
        assert_eq!(innodb_buffer_pool_size(1), "0M");
    }
}
