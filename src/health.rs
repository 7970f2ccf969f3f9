//! Periodic resource checks: free disk space, load average and memory.
//!
//! Readings come from `/proc` and `df`, so the load and memory checks only
//! report on Linux; elsewhere they are skipped with a debug log.

use std::io;
use std::path::Path;

use serde::Serialize;
use tokio::process::Command;

use crate::config::{HealthConfig, Thresholds};
use crate::webhook::{Notification, Notifier};

/// 1, 5 and 15 minute load averages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    /// Parse the contents of `/proc/loadavg`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace().map(str::parse::<f64>);
        Some(Self {
            one: parts.next()?.ok()?,
            five: parts.next()?.ok()?,
            fifteen: parts.next()?.ok()?,
        })
    }
}

/// Memory totals in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub total_kib: u64,
    pub available_kib: u64,
}

impl MemoryInfo {
    /// Parse the contents of `/proc/meminfo`.
    pub fn parse(text: &str) -> Option<Self> {
        let field = |key: &str| {
            text.lines()
                .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
                .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
        };
        let total_kib = field("MemTotal")?;
        let available_kib = field("MemAvailable").or_else(|| field("MemFree"))?;
        if total_kib == 0 {
            return None;
        }
        Some(Self {
            total_kib,
            available_kib,
        })
    }

    pub fn used_percent(&self) -> u64 {
        let used = 1.0 - self.available_kib as f64 / self.total_kib as f64;
        (used * 100.0).round().max(0.0) as u64
    }
}

/// Available bytes from `df -Pk` output (POSIX format, 1 KiB blocks).
pub fn parse_df_available(output: &str) -> Option<u64> {
    let line = output.lines().skip(1).find(|l| !l.trim().is_empty())?;
    let available_kib: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(available_kib * 1024)
}

/// Free bytes on the filesystem holding `path`.
pub async fn free_disk_bytes(path: &Path) -> io::Result<u64> {
    let output = Command::new("df").arg("-Pk").arg(path).output().await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "df exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_available(&stdout)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unrecognised df output"))
}

/// How severe a reading is, relative to its [`Thresholds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Notice,
    Ping,
    Critical,
}

impl Level {
    pub fn classify(percent: u64, thresholds: &Thresholds) -> Option<(Self, u64)> {
        if percent >= thresholds.critical {
            Some((Self::Critical, thresholds.critical))
        } else if percent >= thresholds.ping {
            Some((Self::Ping, thresholds.ping))
        } else if percent >= thresholds.notice {
            Some((Self::Notice, thresholds.notice))
        } else {
            None
        }
    }
}

/// Readings taken by one check run. Missing readings were unavailable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub free_disk_bytes: Option<u64>,
    pub load: Option<LoadAverage>,
    pub load_percent: Option<u64>,
    pub memory_percent: Option<u64>,
    pub alerts: usize,
}

/// Runs the resource checks and reports breaches through the [`Notifier`].
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthConfig,
    notifier: Notifier,
}

impl HealthChecker {
    pub fn new(config: HealthConfig, notifier: Notifier) -> Self {
        Self { config, notifier }
    }

    pub async fn run_health_check(&self) -> HealthReport {
        tracing::info!("Running health check");
        let mut report = HealthReport::default();

        match free_disk_bytes(&self.config.disk_path).await {
            Ok(free) => report.free_disk_bytes = Some(free),
            Err(e) => tracing::error!(
                path = %self.config.disk_path.display(),
                error = %e,
                "Error checking free space"
            ),
        }

        let cpus = std::thread::available_parallelism().map_or(1, usize::from);
        match tokio::fs::read_to_string("/proc/loadavg").await {
            Ok(text) => {
                report.load = LoadAverage::parse(&text);
                report.load_percent = report.load.map(|l| load_percent(&l, cpus));
            }
            Err(e) => tracing::debug!(error = %e, "Load average unavailable"),
        }

        match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(text) => report.memory_percent = MemoryInfo::parse(&text).map(|m| m.used_percent()),
            Err(e) => tracing::debug!(error = %e, "Memory info unavailable"),
        }

        let alerts = self.evaluate(&report);
        report.alerts = alerts.len();
        for alert in alerts {
            self.notifier.send(alert).await;
        }

        tracing::debug!(
            free_disk_bytes = report.free_disk_bytes,
            load_percent = report.load_percent,
            memory_percent = report.memory_percent,
            alerts = report.alerts,
            "Health check finished"
        );
        report
    }

    /// Notifications due for a set of readings.
    pub fn evaluate(&self, report: &HealthReport) -> Vec<Notification> {
        let mut alerts = Vec::new();

        if let Some(free) = report.free_disk_bytes {
            let threshold = self.config.min_free_bytes;
            if free < threshold {
                alerts.push(
                    Notification::new(
                        "Running low on free space",
                        format!("Free space ({free}) < threshold ({threshold})"),
                    )
                    .component("health")
                    .ping(true)
                    .critical(true),
                );
            }
        }

        if let (Some(percent), Some(load)) = (report.load_percent, report.load) {
            if let Some((level, bound)) = Level::classify(percent, &self.config.load) {
                alerts.push(
                    Notification::new(
                        "Load Average High",
                        format!("Current 1m Load Avg > {bound} - {percent}"),
                    )
                    .component("health")
                    .with_info("5m load avg", load.five.to_string())
                    .with_info("15m load avg", load.fifteen.to_string())
                    .ping(level >= Level::Ping)
                    .critical(self.config.high_load_critical && level == Level::Critical),
                );
            }
        }

        if let Some(percent) = report.memory_percent {
            if let Some((level, bound)) = Level::classify(percent, &self.config.memory) {
                alerts.push(
                    Notification::new(
                        "Memory Usage High",
                        format!("Memory usage > {bound}% - {percent}%"),
                    )
                    .component("health")
                    .ping(level >= Level::Ping)
                    .critical(level == Level::Critical),
                );
            }
        }

        alerts
    }
}

fn load_percent(load: &LoadAverage, cpus: usize) -> u64 {
    ((load.one / cpus.max(1) as f64) * 100.0).round().max(0.0) as u64
}
