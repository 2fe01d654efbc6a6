//! Disk and memory readings for the heal scanner.
//!
//! Disk space comes from `df` through the validated subprocess layer;
//! memory comes from `/proc/meminfo`. Both parsers are pure so the heal
//! thresholds can be tested without touching the host.

use anyhow::{Context, Result};

use mc_process::{run, SubprocessDescriptor};

/// Disk free threshold considered critical.
pub const DISK_CRITICAL_BYTES: u64 = 1 << 30;

/// Disk free threshold considered a warning.
pub const DISK_WARNING_BYTES: u64 = 5 * (1 << 30);

/// Available-memory threshold considered critical.
pub const MEMORY_CRITICAL_BYTES: u64 = 512 * (1 << 20);

/// Available-memory threshold considered a warning.
pub const MEMORY_WARNING_BYTES: u64 = 2 * (1 << 30);

/// Free bytes on the filesystem holding `path`.
pub async fn disk_free_bytes(path: &str) -> Result<u64> {
    let descriptor = SubprocessDescriptor::new(
        "df",
        vec!["-Pk".to_string(), path.to_string()],
    )
    .with_timeout_ms(5_000);
    let result = run(&descriptor).await.context("failed to run df")?;
    if !result.success() {
        anyhow::bail!("df exited with {:?}: {}", result.exit_code, result.stderr.trim());
    }
    parse_df_available_kib(&result.stdout)
        .map(|kib| kib * 1024)
        .context("failed to parse df output")
}

/// Available memory from the host.
pub fn memory_available_bytes() -> Result<u64> {
    let raw = std::fs::read_to_string("/proc/meminfo")
        .context("failed to read /proc/meminfo")?;
    parse_meminfo_available_kib(&raw)
        .map(|kib| kib * 1024)
        .context("MemAvailable missing from /proc/meminfo")
}

/// Parses the `Available` column of POSIX `df -Pk` output (KiB units).
pub fn parse_df_available_kib(stdout: &str) -> Option<u64> {
    let data_line = stdout.lines().nth(1)?;
    let fields: Vec<&str> = data_line.split_ascii_whitespace().collect();
    // Filesystem 1024-blocks Used Available Capacity Mounted-on
    fields.get(3)?.parse().ok()
}

/// Parses `MemAvailable` (KiB) out of /proc/meminfo content.
pub fn parse_meminfo_available_kib(raw: &str) -> Option<u64> {
    raw.lines()
        .find(|line| line.starts_with("MemAvailable:"))?
        .split_ascii_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parse_df_available_column() {
        let stdout = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/sda1        102400000  51200000  46080000      53% /
";
        assert_eq!(parse_df_available_kib(stdout), Some(46_080_000));
    }

    #[test]
    fn unit_parse_df_handles_missing_data_line() {
        assert_eq!(parse_df_available_kib("Filesystem only header\n"), None);
        assert_eq!(parse_df_available_kib(""), None);
    }

    #[test]
    fn unit_parse_meminfo_available_line() {
        let raw = "\
MemTotal:       16315880 kB
MemFree:          428356 kB
MemAvailable:    8912344 kB
Buffers:          512004 kB
";
        assert_eq!(parse_meminfo_available_kib(raw), Some(8_912_344));
    }

    #[test]
    fn unit_parse_meminfo_missing_field() {
        assert_eq!(parse_meminfo_available_kib("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn unit_thresholds_are_ordered() {
        assert!(DISK_CRITICAL_BYTES < DISK_WARNING_BYTES);
        assert!(MEMORY_CRITICAL_BYTES < MEMORY_WARNING_BYTES);
    }
}
