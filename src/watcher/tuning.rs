//! Auto-tuning of the worker pool and queue depth from host resources.

/// Runtime parameters chosen once at startup.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub workers: usize,
    pub buffer_size: usize,
    pub cpu_count: usize,
    pub ram_gb: u64,
}

/// Probe the host and derive worker count and queue depth.
pub fn auto_tune() -> Tuning {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let ram_gb = system_memory_gb();
    let (workers, buffer_size) = tune(cpu_count, ram_gb);
    Tuning {
        workers,
        buffer_size,
        cpu_count,
        ram_gb,
    }
}

/// Worker pool scales with CPU (clamped to [2, 32]); the queue depth
/// steps with available memory.
pub(crate) fn tune(cpu_count: usize, ram_gb: u64) -> (usize, usize) {
    let workers = (cpu_count * 2).clamp(2, 32);

    let buffer_size = if ram_gb >= 16 {
        8192
    } else if ram_gb >= 8 {
        4096
    } else {
        2048
    };

    (workers, buffer_size)
}

/// Total system memory in GiB from `/proc/meminfo`, falling back to 8 when
/// the host does not expose a readable value.
pub(crate) fn system_memory_gb() -> u64 {
    read_meminfo_total_kb("/proc/meminfo")
        .map(|kb| (kb / (1024 * 1024)).max(1))
        .unwrap_or(8)
}

fn read_meminfo_total_kb(path: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tune_clamps_low_cpu() {
        let (workers, _) = tune(1, 8);
        assert_eq!(workers, 2);
    }

    #[test]
    fn test_tune_clamps_high_cpu() {
        let (workers, _) = tune(64, 8);
        assert_eq!(workers, 32);
    }

    #[test]
    fn test_tune_scales_with_cpu() {
        let (workers, _) = tune(4, 8);
        assert_eq!(workers, 8);
    }

    #[test]
    fn test_buffer_tiers() {
        assert_eq!(tune(4, 4).1, 2048);
        assert_eq!(tune(4, 8).1, 4096);
        assert_eq!(tune(4, 15).1, 4096);
        assert_eq!(tune(4, 16).1, 8192);
        assert_eq!(tune(4, 64).1, 8192);
    }

    #[test]
    fn test_system_memory_has_fallback() {
        // Whatever the host exposes, the probe never returns zero.
        assert!(system_memory_gb() >= 1);
    }

    #[test]
    fn test_meminfo_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        std::fs::write(&path, "MemTotal:       16315052 kB\nMemFree: 1 kB\n").unwrap();
        let kb = read_meminfo_total_kb(path.to_str().unwrap()).unwrap();
        assert_eq!(kb, 16315052);
    }
}
