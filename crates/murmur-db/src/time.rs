use anyhow::{Result, anyhow};
use chrono::{DateTime, SubsecRound, Utc};

/// Fixed-width so that text order equals time order.
const STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Current time at storage precision. Values produced here survive a
/// store/load round trip unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.format(STORAGE_FORMAT).to_string()
}

pub fn from_db(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| anyhow!("Corrupt timestamp '{}': {}", raw, e))
}
