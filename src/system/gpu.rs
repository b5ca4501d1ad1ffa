//! GPU detection
//!
//! Best-effort VRAM lookup used to suggest ACE-Step's offload flags on
//! constrained cards.

use std::process::Command;

use serde::Serialize;

/// Below this much VRAM, models are offloaded to the CPU between stages.
pub const OFFLOAD_THRESHOLD_MB: u64 = 12 * 1024;
/// Below this much VRAM, the DiT is offloaded as well.
pub const DIT_OFFLOAD_THRESHOLD_MB: u64 = 8 * 1024;

/// Detected GPU
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    /// Only reported by nvidia-smi
    pub vram_used_mb: Option<u64>,
}

/// Offload flags suggested for a card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OffloadAdvice {
    pub offload_to_cpu: bool,
    pub offload_dit_to_cpu: bool,
}

/// Suggest offload flags for `vram_total_mb` of VRAM.
pub fn recommend_offload(vram_total_mb: u64) -> OffloadAdvice {
    OffloadAdvice {
        offload_to_cpu: vram_total_mb < OFFLOAD_THRESHOLD_MB,
        offload_dit_to_cpu: vram_total_mb < DIT_OFFLOAD_THRESHOLD_MB,
    }
}

/// Detect the primary GPU, or `None` when nothing usable answers.
pub fn detect_gpu() -> Option<GpuInfo> {
    if let Some(info) = detect_nvidia_smi() {
        return Some(info);
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(info) = detect_wmic() {
            return Some(info);
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(info) = detect_system_profiler() {
            return Some(info);
        }
    }

    None
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn detect_nvidia_smi() -> Option<GpuInfo> {
    let stdout = run(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ],
    )?;
    parse_nvidia_smi(&stdout)
}

/// Parse the first line of `nvidia-smi --format=csv,noheader,nounits`.
fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_mb: parts[1].parse().ok()?,
        vram_used_mb: parts[2].parse().ok(),
    })
}

#[cfg(target_os = "windows")]
fn detect_wmic() -> Option<GpuInfo> {
    let stdout = run(
        "wmic",
        &[
            "path",
            "Win32_VideoController",
            "get",
            "Name,AdapterRAM",
            "/Format:List",
        ],
    )?;

    let mut name: Option<String> = None;
    let mut adapter_ram_bytes: Option<u64> = None;
    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Name=") {
            if !value.trim().is_empty() {
                name = Some(value.trim().to_string());
            }
        } else if let Some(value) = line.strip_prefix("AdapterRAM=") {
            adapter_ram_bytes = value.trim().parse().ok();
        }
        if name.is_some() && adapter_ram_bytes.is_some() {
            break;
        }
    }

    Some(GpuInfo {
        name: name?,
        vram_total_mb: adapter_ram_bytes.unwrap_or(0) / 1024 / 1024,
        vram_used_mb: None,
    })
}

#[cfg(target_os = "macos")]
fn detect_system_profiler() -> Option<GpuInfo> {
    let stdout = run("system_profiler", &["SPDisplaysDataType"])?;
    let mut name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Chipset Model:") {
            name = Some(value.trim().to_string()).filter(|n| !n.is_empty());
        }
        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 48 GB"
        if line.contains("VRAM") {
            if let Some((_, value)) = line.split_once(':') {
                let mut parts = value.split_whitespace();
                if let (Some(amount), Some(unit)) = (parts.next(), parts.next()) {
                    if let Ok(amount) = amount.parse::<u64>() {
                        vram_mb = Some(if unit.eq_ignore_ascii_case("GB") {
                            amount * 1024
                        } else {
                            amount
                        });
                    }
                }
            }
        }
    }

    let name = name?;
    // Apple Silicon shares system memory with the GPU.
    if vram_mb.is_none() && name.contains("Apple") {
        vram_mb = run("sysctl", &["-n", "hw.memsize"])
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|bytes| bytes / 1024 / 1024);
    }

    Some(GpuInfo {
        name,
        vram_total_mb: vram_mb.unwrap_or(0),
        vram_used_mb: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommend_offload_thresholds() {
        assert_eq!(recommend_offload(24 * 1024), OffloadAdvice::default());
        assert_eq!(
            recommend_offload(10 * 1024),
            OffloadAdvice {
                offload_to_cpu: true,
                offload_dit_to_cpu: false
            }
        );
        assert_eq!(
            recommend_offload(6 * 1024),
            OffloadAdvice {
                offload_to_cpu: true,
                offload_dit_to_cpu: true
            }
        );
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let info = parse_nvidia_smi("\nNVIDIA GeForce RTX 3060, 12288, 512\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 3060");
        assert_eq!(info.vram_total_mb, 12288);
        assert_eq!(info.vram_used_mb, Some(512));
        assert!(parse_nvidia_smi("garbage").is_none());
    }
}
