//! Host memory sampling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

/// Byte counters behind [`MemoryProbe::detail`], converted to MiB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryDetail {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    /// Resident set of this process, standing in for a runtime heap.
    pub heap_mb: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    total_bytes: u64,
    used_bytes: u64,
    available_bytes: u64,
    heap_bytes: u64,
}

/// Publishes the most recent host memory utilisation and byte counters.
///
/// `current_percent` is a single atomic load. The byte counters are swapped
/// whole once per tick, so `detail` never observes a torn snapshot.
pub struct MemoryProbe {
    percent: Arc<AtomicU32>,
    counters: Arc<RwLock<Counters>>,
    shutdown: CancellationToken,
    sampler: Option<JoinHandle<()>>,
}

impl MemoryProbe {
    /// Start the platform sampler. Requires a tokio runtime.
    pub fn spawn(enable_logs: bool) -> Self {
        let percent = Arc::new(AtomicU32::new(0));
        let counters = Arc::new(RwLock::new(Counters::default()));
        let shutdown = CancellationToken::new();

        let cell = Arc::clone(&percent);
        let snapshot = Arc::clone(&counters);
        let sampler = tokio::spawn(sample_loop(cell, snapshot, shutdown.clone(), enable_logs));

        Self {
            percent,
            counters,
            shutdown,
            sampler: Some(sampler),
        }
    }

    /// A probe pinned to an exact value, with no sampler task. Used by tests
    /// and embedders that source utilisation elsewhere.
    pub fn fixed(percent: u32) -> Self {
        Self {
            percent: Arc::new(AtomicU32::new(percent.min(100))),
            counters: Arc::new(RwLock::new(Counters::default())),
            shutdown: CancellationToken::new(),
            sampler: None,
        }
    }

    /// The last sampled utilisation, in `[0, 100]`.
    pub fn current_percent(&self) -> u32 {
        self.percent.load(Ordering::Relaxed)
    }

    /// The last sampled byte counters, reported in MiB.
    pub fn detail(&self) -> MemoryDetail {
        let counters = *self.counters.read().expect("memory snapshot lock poisoned");

        MemoryDetail {
            total_mb: counters.total_bytes / MIB,
            used_mb: counters.used_bytes / MIB,
            available_mb: counters.available_bytes / MIB,
            heap_mb: counters.heap_bytes / MIB,
        }
    }

    /// Stop the sampler task. The published values remain readable.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MemoryProbe {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
    }
}

fn publish(cell: &AtomicU32, snapshot: &RwLock<Counters>, percent: u32, counters: Counters) {
    cell.store(percent, Ordering::Relaxed);
    *snapshot.write().expect("memory snapshot lock poisoned") = counters;
}

#[cfg(target_os = "linux")]
use self::linux::sample_loop;
#[cfg(target_os = "macos")]
use self::macos::sample_loop;

// Without a platform sampler the probe degrades to a fixed midpoint so that
// memory monitoring neither trips nor suppresses admission on its own.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn sample_loop(
    cell: Arc<AtomicU32>,
    snapshot: Arc<RwLock<Counters>>,
    _shutdown: CancellationToken,
    enable_logs: bool,
) {
    if enable_logs {
        warn!(message = "no memory sampler for this platform, publishing a degraded estimate");
    }

    publish(&cell, &snapshot, 50, Counters::default());
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, RwLock};

    use futures::StreamExt;
    use tokio_stream::wrappers::IntervalStream;
    use tokio_util::sync::CancellationToken;

    use super::{publish, Counters};
    use crate::probe::{ProbeError, SAMPLE_INTERVAL};

    pub(super) async fn sample_loop(
        cell: Arc<AtomicU32>,
        snapshot: Arc<RwLock<Counters>>,
        shutdown: CancellationToken,
        enable_logs: bool,
    ) {
        let interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut ticker =
            IntervalStream::new(interval).take_until(Box::pin(shutdown.cancelled_owned()));

        while ticker.next().await.is_some() {
            match sample(Path::new("/proc")) {
                Ok((percent, counters)) => publish(&cell, &snapshot, percent, counters),
                Err(err) => {
                    if enable_logs {
                        warn!(message = "memory sample failed", %err);
                    }
                }
            }
        }
    }

    pub(super) fn sample(proc_path: &Path) -> Result<(u32, Counters), ProbeError> {
        let data = std::fs::read_to_string(proc_path.join("meminfo"))?;
        let (total, available) = parse_meminfo(&data)?;

        // resident set may be unreadable in constrained environments;
        // report zero rather than fail the whole sample
        let heap = read_rss_bytes(proc_path).unwrap_or(0);

        let used = total.saturating_sub(available);
        let percent = if total == 0 {
            0
        } else {
            (100.0 * used as f64 / total as f64).round() as u32
        };

        Ok((
            percent.min(100),
            Counters {
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                heap_bytes: heap,
            },
        ))
    }

    /// Returns `(total, available)` in bytes. Falls back to
    /// `MemFree + Buffers + Cached` on kernels without `MemAvailable`.
    pub(super) fn parse_meminfo(data: &str) -> Result<(u64, u64), ProbeError> {
        let mut total = None;
        let mut available = None;
        let mut free = 0u64;
        let mut buffers = 0u64;
        let mut cached = 0u64;

        for line in data.lines() {
            let mut parts = line.split_ascii_whitespace();
            let Some(key) = parts.next() else { continue };
            let Some(value) = parts.next() else { continue };

            let value = value.parse::<u64>()? * 1024;
            match key {
                "MemTotal:" => total = Some(value),
                "MemAvailable:" => available = Some(value),
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }

        let total = total.ok_or(ProbeError::Malformed("meminfo without MemTotal"))?;
        let available = available.unwrap_or(free + buffers + cached);

        Ok((total, available))
    }

    fn read_rss_bytes(proc_path: &Path) -> Result<u64, ProbeError> {
        let data = std::fs::read_to_string(proc_path.join("self/status"))?;

        parse_rss_bytes(&data)
    }

    pub(super) fn parse_rss_bytes(data: &str) -> Result<u64, ProbeError> {
        let line = data
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .ok_or(ProbeError::Malformed("status without VmRSS"))?;

        let kb = line
            .split_ascii_whitespace()
            .nth(1)
            .ok_or(ProbeError::Malformed("VmRSS line"))?
            .parse::<u64>()?;

        Ok(kb * 1024)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn sample_from_fixture_root() {
            let (percent, counters) = sample(Path::new("tests/proc")).unwrap();

            assert_eq!(counters.total_bytes, 16323740 * 1024);
            assert_eq!(counters.available_bytes, 12456892 * 1024);
            assert_eq!(
                counters.used_bytes,
                (16323740 - 12456892) * 1024
            );
            assert_eq!(counters.heap_bytes, 34567 * 1024);
            // 3866848 / 16323740 is 23.69 percent used
            assert_eq!(percent, 24);
        }

        #[test]
        fn meminfo_without_mem_available() {
            let data = "MemTotal:       1000 kB\n\
                        MemFree:         200 kB\n\
                        Buffers:          50 kB\n\
                        Cached:          150 kB\n";
            let (total, available) = parse_meminfo(data).unwrap();

            assert_eq!(total, 1000 * 1024);
            assert_eq!(available, 400 * 1024);
        }

        #[test]
        fn meminfo_without_total_is_malformed() {
            let err = parse_meminfo("MemFree: 200 kB\n").unwrap_err();
            assert!(matches!(err, ProbeError::Malformed(_)));
        }

        #[test]
        fn rss_from_status() {
            let data = "Name:\tsmartqueue\nVmPeak:\t  123456 kB\nVmRSS:\t   34567 kB\n";
            assert_eq!(parse_rss_bytes(data).unwrap(), 34567 * 1024);
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, RwLock};

    use futures::StreamExt;
    use tokio::process::Command;
    use tokio_stream::wrappers::IntervalStream;
    use tokio_util::sync::CancellationToken;

    use super::{publish, Counters};
    use crate::probe::{ProbeError, SAMPLE_INTERVAL};

    pub(super) async fn sample_loop(
        cell: Arc<AtomicU32>,
        snapshot: Arc<RwLock<Counters>>,
        shutdown: CancellationToken,
        enable_logs: bool,
    ) {
        let interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut ticker =
            IntervalStream::new(interval).take_until(Box::pin(shutdown.cancelled_owned()));

        while ticker.next().await.is_some() {
            match sample().await {
                Ok((percent, counters)) => publish(&cell, &snapshot, percent, counters),
                Err(err) => {
                    if enable_logs {
                        warn!(message = "memory sample failed", %err);
                    }
                }
            }
        }
    }

    async fn sample() -> Result<(u32, Counters), ProbeError> {
        let output = Command::new("sysctl")
            .args(["-n", "hw.memsize", "vm.page_free_count", "vm.pagesize"])
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (total, free) = parse_sysctl(&stdout)?;

        let used = total.saturating_sub(free);
        let percent = if total == 0 {
            0
        } else {
            (100.0 * used as f64 / total as f64).round() as u32
        };

        Ok((
            percent.min(100),
            Counters {
                total_bytes: total,
                used_bytes: used,
                available_bytes: free,
                heap_bytes: max_rss_bytes(),
            },
        ))
    }

    fn parse_sysctl(output: &str) -> Result<(u64, u64), ProbeError> {
        let mut lines = output.lines();
        let total = lines
            .next()
            .ok_or(ProbeError::Malformed("sysctl output"))?
            .trim()
            .parse::<u64>()?;
        let free_pages = lines
            .next()
            .ok_or(ProbeError::Malformed("sysctl output"))?
            .trim()
            .parse::<u64>()?;
        let page_size = lines
            .next()
            .ok_or(ProbeError::Malformed("sysctl output"))?
            .trim()
            .parse::<u64>()?;

        Ok((total, free_pages * page_size))
    }

    fn max_rss_bytes() -> u64 {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
            return 0;
        }

        // ru_maxrss is reported in bytes on macOS
        unsafe { usage.assume_init() }.ru_maxrss as u64
    }

}
