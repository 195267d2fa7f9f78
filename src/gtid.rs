//! Ranking of per-member transaction watermarks.
//!
//! Each live member reports its executed-GTID set as `uuid:start-end`. The
//! member with the greatest `end` holds the most committed transactions and
//! is the only safe source to bootstrap or rejoin a group from.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtidError {
    #[error("invalid gtid format: {0}")]
    Format(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gtid {
    pub uuid: String,
    /// Index of the reporting member in the input list, i.e. its ordinal.
    pub server_id: usize,
    pub start: u64,
    pub end: u64,
}

/// Parses one raw watermark. `Ok(None)` for the `"0"`/`"1"` sentinels a
/// member reports before it has been initialized; those must be excluded
/// from comparison rather than ranked as zero.
fn parse_gtid(raw: &str) -> Result<Option<(String, u64, u64)>, GtidError> {
    let raw = raw.trim();
    if raw == "0" || raw == "1" {
        return Ok(None);
    }

    // An executed set may carry several uuid:interval entries; rank on the
    // leading one, as the engine lists the local server first.
    let head = raw.split(',').next().unwrap().trim();

    let (uuid, intervals) = head
        .split_once(':')
        .ok_or_else(|| GtidError::Format(raw.to_string()))?;
    if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        return Err(GtidError::Format(raw.to_string()));
    }

    let first_interval = intervals.split(':').next().unwrap();
    let (start, end) = first_interval
        .split_once('-')
        .ok_or_else(|| GtidError::Format(raw.to_string()))?;
    let start = start
        .parse::<u64>()
        .map_err(|_| GtidError::Format(raw.to_string()))?;
    let end = end
        .parse::<u64>()
        .map_err(|_| GtidError::Format(raw.to_string()))?;

    Ok(Some((uuid.to_string(), start, end)))
}

/// Returns the record with the greatest `end` across all usable watermarks,
/// or `None` when no member reports a usable one (fresh cluster).
///
/// Ties keep the first occurrence: the scan replaces the current maximum
/// only on a strictly greater `end`, so among equal watermarks the lowest
/// ordinal wins.
pub fn max_gtid_member(watermarks: &[String]) -> Result<Option<Gtid>, GtidError> {
    let mut max: Option<Gtid> = None;
    for (ordinal, raw) in watermarks.iter().enumerate() {
        let (uuid, start, end) = match parse_gtid(raw)? {
            Some(parsed) => parsed,
            None => continue,
        };
        let candidate = Gtid {
            uuid,
            server_id: ordinal,
            start,
            end,
        };
        match max.as_ref() {
            Some(current) if candidate.end <= current.end => {}
            _ => max = Some(candidate),
        }
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermarks(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn greatest_end_wins() {
        let input = watermarks(&[
            "3f65a290-a2f8-11ee-acdd-d08e7908bcb1:1-1049331886",
            "3f65a4e4-a2f8-11ee-acdd-d08e7908bcb1:1-54",
            "46dda72d-ceec-11ee-be3f-d08e7908bcb1:1-1906906",
            "9d4e207c-a2f7-11ee-8953-d08e7908bcb1:1-3294083",
            "f4a28df0-aebc-11ee-98ca-d08e7908bcb1:1-107367635",
            "f4a291f6-aebc-11ee-98ca-d08e7908bcb1:1-9",
        ]);
        let max = max_gtid_member(&input).unwrap().unwrap();
        assert_eq!(max.uuid, "f4a28df0-aebc-11ee-98ca-d08e7908bcb1");
        assert_eq!(max.end, 107367635);
        assert_eq!(max.server_id, 4);
    }

    #[test]
    fn sentinels_are_excluded_not_ranked() {
        let input = watermarks(&["0", "a1:1-50", "b2:1-75", "1"]);
        let max = max_gtid_member(&input).unwrap().unwrap();
        assert_eq!(max.uuid, "b2");
        assert_eq!(max.start, 1);
        assert_eq!(max.end, 75);
        assert_eq!(max.server_id, 2);
    }

    #[test]
    fn all_sentinels_selects_nothing() {
        let input = watermarks(&["0", "1", "0"]);
        assert_eq!(max_gtid_member(&input).unwrap(), None);
        assert_eq!(max_gtid_member(&[]).unwrap(), None);
    }

    #[test]
    fn ties_keep_the_lowest_ordinal() {
        let input = watermarks(&["aa:1-100", "bb:1-100", "cc:1-50"]);
        let max = max_gtid_member(&input).unwrap().unwrap();
        assert_eq!(max.uuid, "aa");
        assert_eq!(max.server_id, 0);
    }

    #[test]
    fn malformed_watermark_is_a_format_error() {
        for bad in ["not a gtid", "abc", "a1:x-5", "a1:5", ":1-5", "g_z!:1-5"] {
            let input = watermarks(&[bad]);
            assert!(
                matches!(max_gtid_member(&input), Err(GtidError::Format(_))),
                "expected format error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn multi_entry_sets_rank_on_the_leading_entry() {
        let input = watermarks(&[
            "aa:1-10,bb:1-999",
            "cc:1-20",
        ]);
        let max = max_gtid_member(&input).unwrap().unwrap();
        assert_eq!(max.uuid, "cc");
        assert_eq!(max.end, 20);
    }
}
