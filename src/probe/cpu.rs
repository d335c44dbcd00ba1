//! Whole-host CPU utilisation sampling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Publishes the most recent whole-host CPU utilisation as a percentage.
///
/// `current_percent` is a single atomic load and never blocks. The sampler
/// task refreshes the value roughly once per second; how a sample is taken
/// depends on the platform the probe was built for.
pub struct CpuProbe {
    percent: Arc<AtomicU32>,
    shutdown: CancellationToken,
    sampler: Option<JoinHandle<()>>,
}

impl CpuProbe {
    /// Start the platform sampler. Requires a tokio runtime.
    pub fn spawn(enable_logs: bool) -> Self {
        let percent = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let cell = Arc::clone(&percent);
        let sampler = tokio::spawn(sample_loop(cell, shutdown.clone(), enable_logs));

        Self {
            percent,
            shutdown,
            sampler: Some(sampler),
        }
    }

    /// A probe pinned to an exact value, with no sampler task. Used by tests
    /// and embedders that source utilisation elsewhere.
    pub fn fixed(percent: u32) -> Self {
        Self {
            percent: Arc::new(AtomicU32::new(percent.min(100))),
            shutdown: CancellationToken::new(),
            sampler: None,
        }
    }

    /// The last sampled utilisation, in `[0, 100]`.
    pub fn current_percent(&self) -> u32 {
        self.percent.load(Ordering::Relaxed)
    }

    /// Stop the sampler task. The published value remains readable.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for CpuProbe {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
    }
}

#[cfg(target_os = "linux")]
use self::linux::sample_loop;
#[cfg(target_os = "macos")]
use self::macos::sample_loop;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
use self::unix_fallback::sample_loop;

#[cfg(not(unix))]
async fn sample_loop(_cell: Arc<AtomicU32>, _shutdown: CancellationToken, enable_logs: bool) {
    if enable_logs {
        warn!(message = "no cpu sampler for this platform, utilisation stays at its initial value");
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio_stream::wrappers::IntervalStream;
    use tokio_util::sync::CancellationToken;

    use crate::probe::{ProbeError, SAMPLE_INTERVAL};

    /// Aggregate jiffy counters from the `cpu` line of `/proc/stat`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(super) struct CpuTimes {
        user: u64,
        nice: u64,
        system: u64,
        idle: u64,
        iowait: u64,
        irq: u64,
        softirq: u64,
        steal: u64,
    }

    impl CpuTimes {
        fn idle_sum(&self) -> u64 {
            self.idle + self.iowait
        }

        fn total(&self) -> u64 {
            self.user
                + self.nice
                + self.system
                + self.idle
                + self.iowait
                + self.irq
                + self.softirq
                + self.steal
        }
    }

    pub(super) async fn sample_loop(
        cell: Arc<AtomicU32>,
        shutdown: CancellationToken,
        enable_logs: bool,
    ) {
        let interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut ticker =
            IntervalStream::new(interval).take_until(Box::pin(shutdown.cancelled_owned()));

        let mut prev: Option<CpuTimes> = None;
        while ticker.next().await.is_some() {
            match read_cpu_times(Path::new("/proc")) {
                Ok(times) => {
                    let percent = match prev {
                        // the first reading has nothing to diff against
                        None => 0,
                        Some(last) => utilization(&last, &times)
                            .unwrap_or_else(|| cell.load(Ordering::Relaxed)),
                    };

                    cell.store(percent, Ordering::Relaxed);
                    prev = Some(times);
                }
                Err(err) => {
                    if enable_logs {
                        warn!(message = "cpu sample failed", %err);
                    }
                }
            }
        }
    }

    pub(super) fn read_cpu_times(proc_path: &Path) -> Result<CpuTimes, ProbeError> {
        let data = std::fs::read_to_string(proc_path.join("stat"))?;

        parse_cpu_times(&data)
    }

    pub(super) fn parse_cpu_times(data: &str) -> Result<CpuTimes, ProbeError> {
        let line = data
            .lines()
            .find(|line| line.starts_with("cpu "))
            .ok_or(ProbeError::Malformed("aggregate cpu line"))?;

        let mut times = CpuTimes::default();
        for (index, part) in line.split_ascii_whitespace().enumerate().skip(1) {
            let v = part.parse().unwrap_or(0u64);

            match index {
                1 => times.user = v,
                2 => times.nice = v,
                3 => times.system = v,
                4 => times.idle = v,
                5 => times.iowait = v,
                6 => times.irq = v,
                7 => times.softirq = v,
                8 => times.steal = v,
                // guest and guest_nice are already folded into user/nice
                _ => break,
            }
        }

        Ok(times)
    }

    /// Busy share of the interval between two readings, or `None` when the
    /// counters did not advance.
    pub(super) fn utilization(prev: &CpuTimes, next: &CpuTimes) -> Option<u32> {
        let total = next.total().saturating_sub(prev.total());
        if total == 0 {
            return None;
        }

        let idle = next.idle_sum().saturating_sub(prev.idle_sum());
        let busy = 100.0 - 100.0 * idle as f64 / total as f64;

        Some((busy.round() as i64).clamp(0, 100) as u32)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_aggregate_line() {
            let data = std::fs::read_to_string("tests/proc/stat").unwrap();
            let times = parse_cpu_times(&data).unwrap();

            assert_eq!(
                times,
                CpuTimes {
                    user: 2255826,
                    nice: 34,
                    system: 526715,
                    idle: 12995659,
                    iowait: 30438,
                    irq: 0,
                    softirq: 97340,
                    steal: 12,
                }
            );
            assert_eq!(times.idle_sum(), 12995659 + 30438);
        }

        #[test]
        fn read_from_fixture_root() {
            let times = read_cpu_times(Path::new("tests/proc")).unwrap();
            assert_eq!(times.total(), 15906024);
        }

        #[test]
        fn missing_aggregate_line() {
            let err = parse_cpu_times("cpu0 1 2 3 4\n").unwrap_err();
            assert!(matches!(err, ProbeError::Malformed(_)));
        }

        #[test]
        fn utilization_between_samples() {
            let prev = CpuTimes {
                user: 100,
                system: 50,
                idle: 800,
                iowait: 50,
                ..Default::default()
            };
            // +60 busy, +40 idle over the tick
            let next = CpuTimes {
                user: 150,
                system: 60,
                idle: 830,
                iowait: 60,
                ..Default::default()
            };

            assert_eq!(utilization(&prev, &next), Some(60));
        }

        #[test]
        fn utilization_without_progress() {
            let times = CpuTimes {
                user: 100,
                idle: 900,
                ..Default::default()
            };

            assert_eq!(utilization(&times, &times), None);
        }

        #[test]
        fn utilization_is_clamped() {
            let prev = CpuTimes::default();
            let all_busy = CpuTimes {
                user: 1000,
                ..Default::default()
            };
            let all_idle = CpuTimes {
                idle: 1000,
                ..Default::default()
            };

            assert_eq!(utilization(&prev, &all_busy), Some(100));
            assert_eq!(utilization(&prev, &all_idle), Some(0));
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio::process::Command;
    use tokio_stream::wrappers::IntervalStream;
    use tokio_util::sync::CancellationToken;

    use crate::probe::{ProbeError, SAMPLE_INTERVAL};

    pub(super) async fn sample_loop(
        cell: Arc<AtomicU32>,
        shutdown: CancellationToken,
        enable_logs: bool,
    ) {
        let interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut ticker =
            IntervalStream::new(interval).take_until(Box::pin(shutdown.cancelled_owned()));

        while ticker.next().await.is_some() {
            match sample().await {
                Ok(percent) => cell.store(percent, Ordering::Relaxed),
                Err(err) => {
                    if enable_logs {
                        warn!(message = "cpu sample failed", %err);
                    }
                }
            }
        }
    }

    async fn sample() -> Result<u32, ProbeError> {
        let output = Command::new("top")
            .args(["-l", "1", "-n", "0"])
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_top(&stdout)
    }

    fn parse_top(output: &str) -> Result<u32, ProbeError> {
        let line = output
            .lines()
            .find(|line| line.starts_with("CPU usage:"))
            .ok_or(ProbeError::Malformed("top CPU usage line"))?;

        let mut user = None;
        let mut sys = None;
        for field in line.trim_start_matches("CPU usage:").split(',') {
            let field = field.trim();
            if let Some(v) = field.strip_suffix("% user") {
                user = Some(v.trim().parse::<f64>()?);
            } else if let Some(v) = field.strip_suffix("% sys") {
                sys = Some(v.trim().parse::<f64>()?);
            }
        }

        match (user, sys) {
            (Some(user), Some(sys)) => Ok(((user + sys).round() as i64).clamp(0, 100) as u32),
            _ => Err(ProbeError::Malformed("top CPU usage line")),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_top_output() {
            let output = "Processes: 521 total\nCPU usage: 7.54% user, 12.32% sys, 80.12% idle\n";
            assert_eq!(parse_top(output).unwrap(), 20);
        }

        #[test]
        fn parse_top_missing_line() {
            assert!(parse_top("Processes: 521 total\n").is_err());
        }
    }
}

// Platforms without a native sampler fall back to the share of wall time
// this process spent on CPU, spread over all cores.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
mod unix_fallback {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use futures::StreamExt;
    use tokio_stream::wrappers::IntervalStream;
    use tokio_util::sync::CancellationToken;

    use crate::probe::SAMPLE_INTERVAL;

    pub(super) async fn sample_loop(
        cell: Arc<AtomicU32>,
        shutdown: CancellationToken,
        _enable_logs: bool,
    ) {
        let interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut ticker =
            IntervalStream::new(interval).take_until(Box::pin(shutdown.cancelled_owned()));

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        let mut prev_cpu = process_cpu_seconds();
        let mut prev_wall = Instant::now();
        while ticker.next().await.is_some() {
            let cpu = process_cpu_seconds();
            let wall = prev_wall.elapsed().as_secs_f64();
            if wall > 0.0 {
                let busy = 100.0 * (cpu - prev_cpu) / (cpus * wall);
                cell.store((busy.round() as i64).clamp(0, 100) as u32, Ordering::Relaxed);
            }

            prev_cpu = cpu;
            prev_wall = Instant::now();
        }
    }

    fn process_cpu_seconds() -> f64 {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
            return 0.0;
        }

        let usage = unsafe { usage.assume_init() };
        let seconds =
            |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;

        seconds(usage.ru_utime) + seconds(usage.ru_stime)
    }
}
