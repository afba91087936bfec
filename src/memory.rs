use std::fs;

/// Resident memory of this process, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub resident_kib: u64,
    pub peak_kib: u64,
}

/// Reads process memory usage for the memory log hook.
///
/// Backed by `/proc/self/status`; on platforms without procfs `sample`
/// simply returns `None` and the hook stays quiet.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryProbe;

impl MemoryProbe {
    pub fn new() -> Self {
        Self
    }

    pub fn sample(&self) -> Option<MemoryReading> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        Self::parse(&status)
    }

    fn parse(status: &str) -> Option<MemoryReading> {
        let mut resident = None;
        let mut peak = None;

        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                resident = parse_kib(rest);
            } else if let Some(rest) = line.strip_prefix("VmHWM:") {
                peak = parse_kib(rest);
            }
        }

        Some(MemoryReading {
            resident_kib: resident?,
            peak_kib: peak?,
        })
    }
}

fn parse_kib(rest: &str) -> Option<u64> {
    rest.trim().strip_suffix("kB")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_procfs_status_lines() {
        let status = "Name:\tmaestro\nVmHWM:\t  5120 kB\nVmRSS:\t  4096 kB\nThreads:\t4\n";
        let reading = MemoryProbe::parse(status).unwrap();

        assert_eq!(reading.resident_kib, 4096);
        assert_eq!(reading.peak_kib, 5120);
    }

    #[test]
    fn missing_fields_read_as_none() {
        assert!(MemoryProbe::parse("Name:\tmaestro\n").is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_sample_reports_nonzero_resident() {
        let reading = MemoryProbe::new().sample().unwrap();
        assert!(reading.resident_kib > 0);
        assert!(reading.peak_kib >= reading.resident_kib);
    }
}
