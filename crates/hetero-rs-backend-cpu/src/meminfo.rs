//! Host memory snapshot for the CPU device.

use std::sync::Once;

use hetero_rs::MemoryInfo;

const MEMINFO_PATH: &str = "/proc/meminfo";

static QUERY_FAILED: Once = Once::new();

/// Free and total host memory, best effort.
///
/// Free is `MemAvailable` (or `MemFree` on kernels without it). When the host cannot be queried
/// the snapshot is all zeros and a warning is logged once.
pub fn host_memory() -> MemoryInfo {
    match read_host_memory() {
        Some(info) => info,
        None => {
            QUERY_FAILED.call_once(|| {
                tracing::warn!(path = MEMINFO_PATH, "host memory query failed; reporting zeros");
            });
            MemoryInfo::default()
        }
    }
}

#[cfg(target_os = "linux")]
fn read_host_memory() -> Option<MemoryInfo> {
    let content = std::fs::read_to_string(MEMINFO_PATH).ok()?;
    parse_meminfo(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_host_memory() -> Option<MemoryInfo> {
    None
}

/// Parses `/proc/meminfo` text; values there are in kibibytes.
pub fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let (mut total, mut available, mut free) = (None, None, None);
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "MemTotal" => &mut total,
            "MemAvailable" => &mut available,
            "MemFree" => &mut free,
            _ => continue,
        };
        *slot = rest
            .split_whitespace()
            .next()
            .and_then(|kib| kib.parse::<usize>().ok())
            .and_then(|kib| kib.checked_mul(1024));
    }
    let total = total.filter(|total| *total > 0)?;
    let free = available.or(free)?.min(total);
    Some(MemoryInfo { free, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_available_over_free() {
        let info = parse_meminfo(
            "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    9000000 kB\n",
        )
        .unwrap();
        assert_eq!(info.total, 16_000_000 * 1024);
        assert_eq!(info.free, 9_000_000 * 1024);
    }

    #[test]
    fn falls_back_to_free_memory() {
        let info = parse_meminfo("MemTotal: 2048 kB\nMemFree: 512 kB\n").unwrap();
        assert_eq!(info.free, 512 * 1024);
        assert_eq!(info.total, 2048 * 1024);
    }

    #[test]
    fn rejects_incomplete_reports() {
        assert!(parse_meminfo("").is_none());
        assert!(parse_meminfo("MemFree: 512 kB\n").is_none());
        assert!(parse_meminfo("MemTotal: 0 kB\nMemFree: 0 kB\n").is_none());
        assert!(parse_meminfo("MemTotal: lots kB\nMemFree: 1 kB\n").is_none());
    }
}
