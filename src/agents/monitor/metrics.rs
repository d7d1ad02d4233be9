//! Host Metrics Collection
//!
//! One-shot snapshot of memory, load, processes, CPU, uptime, platform,
//! root filesystem usage, and local time. Probes read `/proc`,
//! `/etc/os-release`, and `statvfs(2)`; a probe that fails yields zeroed
//! values and a warning rather than failing the snapshot.

use serde::Serialize;
use std::ffi::CString;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStats {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub running: u64,
    pub blocked: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub name: String,
    pub family: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
    pub inodes_total: u64,
    pub inodes_used: u64,
    pub inodes_free: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeInfo {
    /// Zone abbreviation or offset as formatted by `%Z`
    pub zone: String,
    /// Seconds east of UTC
    pub offset: i32,
    /// Unix epoch seconds
    pub now: i64,
}

/// Snapshot of the host
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostMetrics {
    pub memory: MemoryStats,
    pub load: LoadStats,
    pub procs: ProcessStats,
    pub cpu: String,
    pub uptime_seconds: u64,
    pub platform: PlatformInfo,
    pub disk: DiskStats,
    pub time: TimeInfo,
}

impl HostMetrics {
    /// Collect a snapshot of this host
    pub fn collect() -> Self {
        let (load, running, total) = probe("/proc/loadavg", parse_loadavg);
        let blocked = probe("/proc/stat", parse_procs_blocked);

        Self {
            memory: probe("/proc/meminfo", parse_meminfo),
            load,
            procs: ProcessStats {
                running,
                blocked,
                total,
            },
            cpu: probe("/proc/cpuinfo", parse_cpu_description),
            uptime_seconds: probe("/proc/uptime", parse_uptime),
            platform: probe("/etc/os-release", parse_os_release),
            disk: disk_usage(Path::new("/")).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read disk usage for /");
                DiskStats::default()
            }),
            time: local_time(),
        }
    }

    /// Fields in the order and naming the monitoring endpoint expects
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("mem[total]", self.memory.total.to_string()),
            ("mem[free]", self.memory.free.to_string()),
            ("mem[used]", self.memory.used.to_string()),
            ("mem[used_percent]", self.memory.used_percent.to_string()),
            ("load[1]", self.load.load1.to_string()),
            ("load[5]", self.load.load5.to_string()),
            ("load[15]", self.load.load15.to_string()),
            ("procs[running]", self.procs.running.to_string()),
            ("procs[blocked]", self.procs.blocked.to_string()),
            ("procs[total]", self.procs.total.to_string()),
            ("cpu", self.cpu.clone()),
            ("uptime_seconds", self.uptime_seconds.to_string()),
            ("platform[name]", self.platform.name.clone()),
            ("platform[family]", self.platform.family.clone()),
            ("platform[version]", self.platform.version.clone()),
            ("disk[total]", self.disk.total.to_string()),
            ("disk[used]", self.disk.used.to_string()),
            ("disk[free]", self.disk.free.to_string()),
            // Carries the used percentage; the name is what the API expects.
            ("disk[percent_free]", format!("{:.2}", self.disk.used_percent)),
            ("disk[inodes_total]", self.disk.inodes_total.to_string()),
            ("disk[inodes_used]", self.disk.inodes_used.to_string()),
            ("disk[inodes_free]", self.disk.inodes_free.to_string()),
            ("time[zone]", self.time.zone.clone()),
            ("time[offset]", self.time.offset.to_string()),
            ("time[now]", self.time.now.to_string()),
        ]
    }
}

fn probe<T: Default>(path: &str, parse: fn(&str) -> T) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents),
        Err(e) => {
            warn!(path = %path, error = %e, "Metric probe failed");
            T::default()
        }
    }
}

/// Parse `/proc/meminfo`; values are reported in bytes
pub fn parse_meminfo(contents: &str) -> MemoryStats {
    let field = |name: &str| -> Option<u64> {
        contents.lines().find_map(|line| {
            let (key, rest) = line.split_once(':')?;
            if key.trim() != name {
                return None;
            }
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kb * 1024)
        })
    };

    let total = field("MemTotal").unwrap_or(0);
    let free = field("MemFree").unwrap_or(0);
    let available = field("MemAvailable").unwrap_or_else(|| {
        free + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
    });
    let used = total.saturating_sub(available);
    let used_percent = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    MemoryStats {
        total,
        free,
        used,
        used_percent,
    }
}

/// Parse `/proc/loadavg` into load averages plus running/total process counts
pub fn parse_loadavg(contents: &str) -> (LoadStats, u64, u64) {
    let fields: Vec<&str> = contents.split_whitespace().collect();
    let num = |i: usize| fields.get(i).and_then(|f| f.parse::<f64>().ok()).unwrap_or(0.0);

    let (running, total) = fields
        .get(3)
        .and_then(|f| f.split_once('/'))
        .map(|(r, t)| (r.parse().unwrap_or(0), t.parse().unwrap_or(0)))
        .unwrap_or((0, 0));

    (
        LoadStats {
            load1: num(0),
            load5: num(1),
            load15: num(2),
        },
        running,
        total,
    )
}

/// `procs_blocked` from `/proc/stat`
pub fn parse_procs_blocked(contents: &str) -> u64 {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("procs_blocked"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// CPU model and logical core count from `/proc/cpuinfo`
pub fn parse_cpu_description(contents: &str) -> String {
    let cores = contents
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count();
    let model = contents
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim() == "model name" || k.trim() == "Hardware")
        .map(|(_, v)| v.trim().to_string())
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    format!("{} ({} cores)", model, cores.max(1))
}

/// Whole seconds from `/proc/uptime`
pub fn parse_uptime(contents: &str) -> u64 {
    contents
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u64)
        .unwrap_or(0)
}

/// `ID`, `ID_LIKE`, and `VERSION_ID` from `/etc/os-release`
pub fn parse_os_release(contents: &str) -> PlatformInfo {
    let value = |key: &str| -> String {
        contents
            .lines()
            .filter_map(|l| l.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
            .unwrap_or_default()
    };

    let name = value("ID");
    let family = {
        let like = value("ID_LIKE");
        if like.is_empty() {
            name.clone()
        } else {
            like
        }
    };

    PlatformInfo {
        name,
        family,
        version: value("VERSION_ID"),
    }
}

/// Usage of the filesystem holding `path`
pub fn disk_usage(path: &Path) -> std::io::Result<DiskStats> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so the struct is filled in.
    let stat = unsafe { stat.assume_init() };

    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let free = stat.f_bavail as u64 * frsize;
    let used = (stat.f_blocks as u64).saturating_sub(stat.f_bfree as u64) * frsize;
    let used_percent = if used + free > 0 {
        used as f64 / (used + free) as f64 * 100.0
    } else {
        0.0
    };
    let inodes_total = stat.f_files as u64;
    let inodes_free = stat.f_ffree as u64;

    Ok(DiskStats {
        total,
        used,
        free,
        used_percent,
        inodes_total,
        inodes_used: inodes_total.saturating_sub(inodes_free),
        inodes_free,
    })
}

fn local_time() -> TimeInfo {
    let now = chrono::Local::now();
    TimeInfo {
        zone: now.format("%Z").to_string(),
        offset: now.offset().local_minus_utc(),
        now: now.timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000 kB\nMemFree:         4000 kB\nMemAvailable:    8000 kB\nBuffers:          100 kB\n";
        let mem = parse_meminfo(meminfo);

        assert_eq!(mem.total, 16000 * 1024);
        assert_eq!(mem.free, 4000 * 1024);
        assert_eq!(mem.used, 8000 * 1024);
        assert!((mem.used_percent - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let meminfo = "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 200 kB\n";
        let mem = parse_meminfo(meminfo);
        assert_eq!(mem.used, 500 * 1024);
    }

    #[test]
    fn test_parse_loadavg() {
        let (load, running, total) = parse_loadavg("0.52 0.58 0.59 3/467 12345\n");

        assert_eq!(load.load1, 0.52);
        assert_eq!(load.load5, 0.58);
        assert_eq!(load.load15, 0.59);
        assert_eq!(running, 3);
        assert_eq!(total, 467);
    }

    #[test]
    fn test_parse_procs_blocked() {
        let stat = "cpu  1 2 3 4\nprocs_running 2\nprocs_blocked 5\n";
        assert_eq!(parse_procs_blocked(stat), 5);
        assert_eq!(parse_procs_blocked(""), 0);
    }

    #[test]
    fn test_parse_cpu_description() {
        let cpuinfo = "processor\t: 0\nmodel name\t: Example CPU @ 2.0GHz\n\nprocessor\t: 1\nmodel name\t: Example CPU @ 2.0GHz\n";
        assert_eq!(parse_cpu_description(cpuinfo), "Example CPU @ 2.0GHz (2 cores)");
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), 350735);
        assert_eq!(parse_uptime(""), 0);
    }

    #[test]
    fn test_parse_os_release() {
        let release = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n";
        let platform = parse_os_release(release);

        assert_eq!(platform.name, "ubuntu");
        assert_eq!(platform.family, "debian");
        assert_eq!(platform.version, "22.04");

        let platform = parse_os_release("ID=debian\nVERSION_ID=\"12\"\n");
        assert_eq!(platform.family, "debian");
    }

    #[test]
    fn test_disk_usage_root() {
        let disk = disk_usage(Path::new("/")).unwrap();
        assert!(disk.total > 0);
        assert!(disk.used_percent >= 0.0 && disk.used_percent <= 100.0);
    }

    #[test]
    fn test_form_fields_cover_endpoint_contract() {
        let metrics = HostMetrics {
            disk: DiskStats {
                used_percent: 41.256,
                ..Default::default()
            },
            ..Default::default()
        };
        let fields = metrics.form_fields();
        let names: Vec<_> = fields.iter().map(|(k, _)| *k).collect();

        for expected in [
            "mem[total]",
            "load[15]",
            "procs[blocked]",
            "cpu",
            "uptime_seconds",
            "platform[family]",
            "disk[inodes_free]",
            "time[zone]",
            "time[offset]",
            "time[now]",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert_eq!(fields.len(), 25);
        assert!(fields.contains(&("disk[percent_free]", "41.26".to_string())));
    }
}
