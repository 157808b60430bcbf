use anyhow::Result;
use colored::*;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::bom::BillOfMaterials;
use crate::config::Config;

// ============================================================================
// Audit Log
// ============================================================================

const AUDIT_LOG_NAME: &str = "audit.log";
const MAX_AUDIT_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// One JSON line per completed analysis.
#[derive(Debug, Serialize)]
pub(crate) struct AuditEntry<'a> {
    pub(crate) timestamp: String,
    pub(crate) source: &'a str,
    pub(crate) sha256: &'a str,
    pub(crate) size_bytes: usize,
    pub(crate) root_status: &'a str,
    pub(crate) risk_score: u8,
    pub(crate) static_findings: usize,
    pub(crate) offline: bool,
    pub(crate) bill_of_materials: &'a BillOfMaterials,
}

/// Current time as `YYYY-MM-DDTHH:MM:SSZ`.
pub(crate) fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    format_timestamp(secs)
}

fn format_timestamp(secs: u64) -> String {
    let (year, month, day) = days_to_date(secs / 86400);
    let time_of_day = secs % 86400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

/// Append to `<dir>/audit.log`, rotating to `audit.log.1` past 10 MiB.
pub(crate) fn append_audit_entry(dir: &Path, entry: &AuditEntry<'_>) -> Result<()> {
    fs::create_dir_all(dir)?;
    let log_path = dir.join(AUDIT_LOG_NAME);

    if let Ok(meta) = fs::metadata(&log_path) {
        if meta.len() > MAX_AUDIT_LOG_BYTES {
            let _ = fs::rename(&log_path, dir.join("audit.log.1"));
        }
    }

    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&log_path, fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Failures here never abort an analysis.
pub(crate) fn write_audit_log(entry: &AuditEntry<'_>) {
    let result = Config::config_dir().and_then(|dir| append_audit_entry(&dir, entry));
    if let Err(e) = result {
        tracing::warn!(error = %e, "audit log write failed");
        eprintln!("{} Failed to write audit log: {}", "⚠".yellow(), e);
    }
}

/// Convert days since Unix epoch to (year, month, day)
pub(crate) fn days_to_date(days: u64) -> (u64, u64, u64) {
    // http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{TrustRecord, TrustStatus};

    #[test]
    fn test_days_to_date() {
        assert_eq!(days_to_date(0), (1970, 1, 1));
        assert_eq!(days_to_date(19723), (2024, 1, 1));
        assert_eq!(days_to_date(10957), (2000, 1, 1));
    }

    #[test]
    fn test_days_to_date_leap_year() {
        assert_eq!(days_to_date(19782), (2024, 2, 29));
        assert_eq!(days_to_date(20088), (2024, 12, 31));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(19723 * 86400 + 3661), "2024-01-01T01:01:01Z");
    }

    #[test]
    fn test_append_audit_entry_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let bom = BillOfMaterials::aggregate(
            vec![TrustRecord {
                url: "https://x.example/a.sh".to_string(),
                status: TrustStatus::Unverified,
                detail: Some("no registry entry for this URL".to_string()),
            }],
            vec!["tool.tar.gz".to_string()],
        );
        let entry = AuditEntry {
            timestamp: format_timestamp(0),
            source: "install \"quoted\".sh",
            sha256: "abc",
            size_bytes: 12,
            root_status: "unverified",
            risk_score: 6,
            static_findings: 0,
            offline: true,
            bill_of_materials: &bom,
        };
        append_audit_entry(dir.path(), &entry).unwrap();
        append_audit_entry(dir.path(), &entry).unwrap();

        let content = fs::read_to_string(dir.path().join(AUDIT_LOG_NAME)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["source"], "install \"quoted\".sh");
        assert_eq!(parsed["risk_score"], 6);
        assert_eq!(
            parsed["bill_of_materials"]["remoteScripts"][0]["status"],
            "unverified"
        );
        assert_eq!(parsed["bill_of_materials"]["externalBinaries"][0], "tool.tar.gz");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(AUDIT_LOG_NAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_audit_log_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(AUDIT_LOG_NAME);
        let file = fs::File::create(&log_path).unwrap();
        file.set_len(MAX_AUDIT_LOG_BYTES + 1).unwrap();

        let bom = BillOfMaterials::default();
        let entry = AuditEntry {
            timestamp: format_timestamp(0),
            source: "-",
            sha256: "abc",
            size_bytes: 0,
            root_status: "unverified",
            risk_score: 1,
            static_findings: 0,
            offline: true,
            bill_of_materials: &bom,
        };
        append_audit_entry(dir.path(), &entry).unwrap();

        assert!(dir.path().join("audit.log.1").exists());
        assert_eq!(fs::read_to_string(&log_path).unwrap().lines().count(), 1);
    }
}
