//! Derivation of per-member identity from the declared cluster shape.
//!
//! Identities are recomputed on every pass and never stored; the only
//! cluster-lifetime state is the replication group name, which the
//! reconciler persists as an annotation and passes in from outside so that
//! planning itself stays deterministic.

use crate::common::{GROUP_COMM_PORT, MYSQL_PORT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    pub ordinal: i32,
    /// Engine server id; the ordinal is already unique and stable.
    pub server_id: i32,
    /// Stable DNS name of the member pod behind the headless service.
    pub host: String,
    /// Replication-communication endpoints of every planned member.
    pub seeds: Vec<String>,
    pub report_port: i32,
}

impl MemberIdentity {
    /// The member's own replication-communication endpoint.
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.host, GROUP_COMM_PORT)
    }
}

/// Plans the full member set for a cluster. Pure and deterministic: the
/// same name/namespace/size always yield the same identities.
pub fn plan(name: &str, namespace: &str, size: i32) -> Vec<MemberIdentity> {
    let hosts: Vec<String> = (0..size)
        .map(|ordinal| member_host(name, namespace, ordinal))
        .collect();
    let seeds: Vec<String> = hosts
        .iter()
        .map(|host| format!("{}:{}", host, GROUP_COMM_PORT))
        .collect();

    (0..size)
        .map(|ordinal| MemberIdentity {
            ordinal,
            server_id: ordinal,
            host: hosts[ordinal as usize].clone(),
            seeds: seeds.clone(),
            report_port: MYSQL_PORT,
        })
        .collect()
}

/// Each member runs as pod 0 of its own single-replica workload
/// `{name}-{ordinal}`, resolved through the `{name}-headless` service.
pub fn member_host(name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "{name}-{ordinal}-0.{name}-headless.{namespace}.svc.cluster.local",
        name = name,
        ordinal = ordinal,
        namespace = namespace,
    )
}

/// Parses a Kubernetes resource quantity (`512Mi`, `1Gi`, `2G`, plain
/// bytes) into bytes. Returns `None` for shapes we do not size from.
pub fn parse_memory_quantity(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    let split = quantity.find(|c: char| !c.is_ascii_digit());
    let (digits, suffix) = match split {
        Some(idx) => quantity.split_at(idx),
        None => (quantity, ""),
    };
    let value = digits.parse::<i64>().ok()?;

    let multiplier: i64 = match suffix {
        "" => 1,
        "k" => 1000,
        "M" => 1000 * 1000,
        "G" => 1000 * 1000 * 1000,
        "T" => 1000 * 1000 * 1000 * 1000,
        "Ki" => 1024,
        "Mi" => 1024 * 1024,
        "Gi" => 1024 * 1024 * 1024,
        "Ti" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_deterministic() {
        let first = plan("db", "prod", 3);
        let second = plan("db", "prod", 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn identities_are_bound_to_ordinals() {
        let members = plan("db", "prod", 3);
        for (idx, member) in members.iter().enumerate() {
            assert_eq!(member.ordinal, idx as i32);
            assert_eq!(member.server_id, idx as i32);
            assert_eq!(member.report_port, 3306);
        }
        assert_eq!(
            members[1].host,
            "db-1-0.db-headless.prod.svc.cluster.local"
        );
        assert_eq!(
            members[1].local_address(),
            "db-1-0.db-headless.prod.svc.cluster.local:33061"
        );
    }

    #[test]
    fn every_member_seeds_from_all_peers() {
        let members = plan("db", "prod", 3);
        let expected: Vec<String> = (0..3)
            .map(|i| format!("db-{}-0.db-headless.prod.svc.cluster.local:33061", i))
            .collect();
        for member in &members {
            assert_eq!(member.seeds, expected);
        }
    }

    #[test]
    fn empty_cluster_plans_no_members() {
        assert!(plan("db", "prod", 0).is_empty());
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_quantity("1024"), Some(1024));
        assert_eq!(parse_memory_quantity("1Ki"), Some(1024));
        assert_eq!(parse_memory_quantity("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("2G"), Some(2_000_000_000));
        assert_eq!(parse_memory_quantity("1500k"), Some(1_500_000));
        assert_eq!(parse_memory_quantity(""), None);
        assert_eq!(parse_memory_quantity("abc"), None);
        assert_eq!(parse_memory_quantity("1Xi"), None);
    }
}
