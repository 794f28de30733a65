//! VRAM monitor
//!
//! Read-only sampling of GPU memory. [`NvidiaSmiProbe`] shells out to
//! `nvidia-smi`; a host without the binary or without a device reports the
//! CPU-only status instead of an error.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::ProbeError;

/// A process holding GPU memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub mem_mb: u64,
}

/// Point-in-time GPU memory state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramStatus {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub safety_margin_mb: u64,
    pub sampled_at: DateTime<Utc>,
    pub processes: Vec<GpuProcess>,
}

impl VramStatus {
    /// Status of a host with no usable GPU (remote-only mode)
    #[must_use]
    pub fn cpu_only() -> Self {
        Self {
            total_mb: 0,
            used_mb: 0,
            free_mb: 0,
            safety_margin_mb: 0,
            sampled_at: Utc::now(),
            processes: Vec::new(),
        }
    }

    /// Status with the given totals
    #[must_use]
    pub fn new(total_mb: u64, used_mb: u64, free_mb: u64) -> Self {
        Self {
            total_mb,
            used_mb,
            free_mb,
            safety_margin_mb: 0,
            sampled_at: Utc::now(),
            processes: Vec::new(),
        }
    }

    /// With safety margin
    #[inline]
    #[must_use]
    pub fn with_safety_margin(mut self, margin_mb: u64) -> Self {
        self.safety_margin_mb = margin_mb;
        self
    }

    /// With process list
    #[must_use]
    pub fn with_processes(mut self, processes: Vec<GpuProcess>) -> Self {
        self.processes = processes;
        self
    }

    /// Whether a device was detected
    #[inline]
    #[must_use]
    pub const fn has_device(&self) -> bool {
        self.total_mb > 0
    }

    /// Memory usable for a new allocation: `free_mb - safety_margin_mb`,
    /// saturating at zero
    #[inline]
    #[must_use]
    pub const fn available_mb(&self) -> u64 {
        self.free_mb.saturating_sub(self.safety_margin_mb)
    }

    /// Whether an allocation of `estimated_mb` fits under the margin
    #[inline]
    #[must_use]
    pub const fn fits(&self, estimated_mb: u64) -> bool {
        self.available_mb() >= estimated_mb
    }
}

/// Source of [`VramStatus`] samples
#[async_trait]
pub trait VramProbe: Send + Sync {
    /// Take one sample. Pure read.
    ///
    /// # Errors
    /// Returns error if a device is present but cannot be queried
    async fn sample(&self) -> Result<VramStatus, ProbeError>;
}

/// Probe backed by the `nvidia-smi` CLI
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: PathBuf,
    gpu_index: u32,
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nvidia-smi"),
            gpu_index: 0,
            timeout: Duration::from_secs(5),
        }
    }
}

impl NvidiaSmiProbe {
    /// Probe GPU `gpu_index`
    #[must_use]
    pub fn new(gpu_index: u32) -> Self {
        Self {
            gpu_index,
            ..Self::default()
        }
    }

    /// With a non-default binary path
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// With command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the binary; `Ok(None)` means no binary or no device.
    async fn query(&self, query: &str) -> Result<Option<String>, ProbeError> {
        let run = Command::new(&self.binary)
            .arg("-i")
            .arg(self.gpu_index.to_string())
            .arg(query)
            .arg("--format=csv,noheader,nounits")
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => return Err(ProbeError::Timeout(self.timeout)),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                debug!(binary = %self.binary.display(), "nvidia-smi not found, assuming cpu-only");
                return Ok(None);
            }
            Ok(Err(e)) => return Err(ProbeError::Io(e.to_string())),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("No devices were found") || stderr.contains("No devices were found")
            {
                return Ok(None);
            }
            return Err(ProbeError::CommandFailed {
                status: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(Some(stdout))
    }
}

#[async_trait]
impl VramProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Result<VramStatus, ProbeError> {
        let Some(memory) = self
            .query("--query-gpu=memory.total,memory.used,memory.free")
            .await?
        else {
            return Ok(VramStatus::cpu_only());
        };
        if memory.trim().is_empty() {
            return Ok(VramStatus::cpu_only());
        }
        let (total_mb, used_mb, free_mb) = parse_memory_line(&memory)?;

        let processes = self
            .query("--query-compute-apps=pid,process_name,used_memory")
            .await?
            .map(|out| parse_process_lines(&out))
            .unwrap_or_default();

        Ok(VramStatus::new(total_mb, used_mb, free_mb).with_processes(processes))
    }
}

/// Parse `total, used, free` (MiB) from the first output line
///
/// # Errors
/// Returns [`ProbeError::Parse`] on anything but three integers
pub fn parse_memory_line(output: &str) -> Result<(u64, u64, u64), ProbeError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ProbeError::Parse("empty memory query output".into()))?;

    let fields: Vec<u64> = line
        .split(',')
        .map(|f| f.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| ProbeError::Parse(format!("{line:?}: {e}")))?;

    match fields.as_slice() {
        [total, used, free] => Ok((*total, *used, *free)),
        _ => Err(ProbeError::Parse(format!(
            "expected 3 fields, got {}: {line:?}",
            fields.len()
        ))),
    }
}

/// Parse `pid, process_name, used_memory` lines, skipping malformed ones
#[must_use]
pub fn parse_process_lines(output: &str) -> Vec<GpuProcess> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            // process names may contain commas
            let (pid, rest) = line.split_once(',')?;
            let (name, mem) = rest.rsplit_once(',')?;
            Some(GpuProcess {
                pid: pid.trim().parse().ok()?,
                name: name.trim().to_string(),
                mem_mb: mem.trim().parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_query() {
        assert_eq!(
            parse_memory_line("24576, 8120, 16456\n").unwrap(),
            (24576, 8120, 16456)
        );
        assert!(parse_memory_line("").is_err());
        assert!(parse_memory_line("24576, [N/A], 100").is_err());
        assert!(parse_memory_line("1, 2").is_err());
    }

    #[test]
    fn parses_process_query() {
        let out = "1234, python3, 8000\n99, /usr/bin/worker, with, commas, 512\nbogus line\n";
        let procs = parse_process_lines(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1234);
        assert_eq!(procs[0].mem_mb, 8000);
        assert_eq!(procs[1].name, "/usr/bin/worker, with, commas");
    }

    #[test]
    fn available_respects_margin() {
        let status = VramStatus::new(24_000, 23_500, 500).with_safety_margin(1000);
        assert_eq!(status.available_mb(), 0);
        assert!(!status.fits(1));

        let status = VramStatus::new(24_000, 4_000, 20_000).with_safety_margin(1000);
        assert!(status.fits(19_000));
        assert!(!status.fits(19_001));
    }

    #[test]
    fn cpu_only_has_no_device() {
        let status = VramStatus::cpu_only();
        assert!(!status.has_device());
        assert_eq!(status.free_mb, 0);
    }

    #[tokio::test]
    async fn missing_binary_is_cpu_only() {
        let probe = NvidiaSmiProbe::new(0).with_binary("/nonexistent/pictor/nvidia-smi");
        let status = probe.sample().await.unwrap();
        assert_eq!(status.total_mb, 0);
        assert_eq!(status.free_mb, 0);
    }
}
