use chrono::{NaiveDateTime, Timelike};
use dsa110_contracts::error::{PipelineError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Parsed identity of a UVH5 shard filename: `YYYY-MM-DDTHH:MM:SS_sbNN.hdf5`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardName {
    pub timestamp: NaiveDateTime,
    pub subband_code: String,
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})_(sb\d{2})\.hdf5$",
        )
        .expect("static regex is valid")
    })
}

/// Parse a shard filename into its timestamp and subband code
/// (spec §4.A: filename regex `YYYY-MM-DDTHH:MM:SS_sbNN.hdf5`).
pub fn parse_shard_filename(filename: &str) -> Result<ShardName> {
    let captures = filename_regex().captures(filename).ok_or_else(|| {
        PipelineError::Validation(format!("filename does not match UVH5 shard grammar: {filename}"))
    })?;

    let timestamp_str = &captures[1];
    let subband_code = captures[2].to_string();

    let timestamp = NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S")
        .map_err(|err| PipelineError::Validation(format!("invalid timestamp in {filename}: {err}")))?;

    Ok(ShardName {
        timestamp,
        subband_code,
    })
}

/// Derive the `group_id` that clusters shards of one observation together
/// by flooring the timestamp to the nearest `tolerance_seconds` boundary
/// (spec §3, §4.A: "two files written up to 10 s apart are guaranteed to
/// share it").
pub fn derive_group_id(timestamp: &NaiveDateTime, tolerance_seconds: u32) -> String {
    let tolerance_seconds = tolerance_seconds.max(1) as i64;
    let seconds_since_midnight = timestamp.num_seconds_from_midnight() as i64;
    let floored = (seconds_since_midnight / tolerance_seconds) * tolerance_seconds;
    let delta = floored - seconds_since_midnight;
    let floored_timestamp = *timestamp + chrono::Duration::seconds(delta);
    floored_timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Default clustering tolerance for `group_id` derivation (spec §4.A).
pub const DEFAULT_GROUP_TOLERANCE_SECONDS: u32 = 10;

/// Expected subband codes `sb00`..`sb15` in ascending order (spec §3).
pub fn expected_subband_codes(count: u32) -> Vec<String> {
    (0..count).map(|i| format!("sb{i:02}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_shard_filename() {
        let parsed = parse_shard_filename("2024-03-05T12:00:03_sb07.hdf5").unwrap();
        assert_eq!(parsed.subband_code, "sb07");
        assert_eq!(parsed.timestamp.and_utc().timestamp(), {
            use chrono::NaiveDate;
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(12, 0, 3)
                .unwrap()
                .and_utc()
                .timestamp()
        });
    }

    #[test]
    fn rejects_malformed_filename() {
        assert!(parse_shard_filename("not-a-shard.hdf5").is_err());
        assert!(parse_shard_filename("2024-03-05T12:00:03_sb7.hdf5").is_err());
    }

    #[test]
    fn shards_within_tolerance_share_group_id() {
        let a = parse_shard_filename("2024-03-05T12:00:00_sb00.hdf5").unwrap();
        let b = parse_shard_filename("2024-03-05T12:00:07_sb15.hdf5").unwrap();
        assert_eq!(
            derive_group_id(&a.timestamp, 10),
            derive_group_id(&b.timestamp, 10)
        );
    }

    #[test]
    fn shards_spanning_a_boundary_differ() {
        let a = parse_shard_filename("2024-03-05T12:00:09_sb00.hdf5").unwrap();
        let b = parse_shard_filename("2024-03-05T12:00:11_sb01.hdf5").unwrap();
        assert_ne!(
            derive_group_id(&a.timestamp, 10),
            derive_group_id(&b.timestamp, 10)
        );
    }

    #[test]
    fn expected_codes_are_zero_padded() {
        let codes = expected_subband_codes(16);
        assert_eq!(codes.first().unwrap(), "sb00");
        assert_eq!(codes.last().unwrap(), "sb15");
        assert_eq!(codes.len(), 16);
    }
}
