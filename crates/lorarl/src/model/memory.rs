//! Device memory pressure detection.

use std::process::Command;
use tch::{Device, TchError};

/// Device memory inspection used around generation.
pub trait MemoryProbe: Send {
    /// Wait for queued device work to finish.
    fn synchronize(&self, device: Device);

    /// Whether device memory is at or above the high-water mark.
    fn is_saturated(&self, device: Device) -> bool;

    /// Bring the device to a settled state after generation ran out of memory.
    ///
    /// The failed step's tensors are dropped by the caller; blocks cached by the libtorch
    /// allocator stay reserved for reuse by the process.
    fn settle_after_exhaustion(&self, device: Device);
}

/// Probe backed by libtorch and `nvidia-smi`.
#[derive(Clone, Debug)]
pub struct TorchMemoryProbe {
    /// Fraction of total device memory treated as saturated
    pub high_water_fraction: f64,
}

impl Default for TorchMemoryProbe {
    fn default() -> Self {
        Self {
            high_water_fraction: 0.95,
        }
    }
}

impl MemoryProbe for TorchMemoryProbe {
    fn synchronize(&self, device: Device) {
        if let Device::Cuda(index) = device {
            tch::Cuda::synchronize(index as i64);
        }
    }

    fn is_saturated(&self, device: Device) -> bool {
        let Device::Cuda(index) = device else {
            return false;
        };
        match query_device_memory(index) {
            Some((used, total)) if total > 0.0 => used / total >= self.high_water_fraction,
            _ => false,
        }
    }

    fn settle_after_exhaustion(&self, device: Device) {
        self.synchronize(device);
        tracing::warn!(
            device = ?device,
            "Device synchronized after memory exhaustion, cached allocator blocks are kept"
        );
    }
}

/// Used and total MiB of a CUDA device, best effort.
fn query_device_memory(index: usize) -> Option<(f64, f64)> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used,memory.total",
            "--format=csv,noheader,nounits",
            &format!("--id={}", index),
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::warn!(index, "nvidia-smi memory query failed");
        return None;
    }
    parse_memory_query(&String::from_utf8_lossy(&output.stdout))
}

fn parse_memory_query(text: &str) -> Option<(f64, f64)> {
    let line = text.lines().next()?;
    let mut fields = line.split(',').map(|f| f.trim().parse::<f64>());
    let used = fields.next()?.ok()?;
    let total = fields.next()?.ok()?;
    Some((used, total))
}

/// Whether a torch error reports device memory exhaustion.
pub fn is_out_of_memory(err: &TchError) -> bool {
    err.to_string().to_ascii_lowercase().contains("out of memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_query() {
        assert_eq!(parse_memory_query("1024, 24576\n"), Some((1024.0, 24576.0)));
        assert_eq!(parse_memory_query(""), None);
        assert_eq!(parse_memory_query("N/A, 24576"), None);
    }

    #[test]
    fn test_cpu_is_never_saturated() {
        let probe = TorchMemoryProbe::default();
        assert!(!probe.is_saturated(Device::Cpu));
        probe.synchronize(Device::Cpu);
        probe.settle_after_exhaustion(Device::Cpu);
    }

    #[test]
    fn test_out_of_memory_detection() {
        let oom = TchError::Torch("CUDA out of memory. Tried to allocate 2.00 GiB".to_string());
        assert!(is_out_of_memory(&oom));
        let other = TchError::Torch("shape mismatch".to_string());
        assert!(!is_out_of_memory(&other));
    }
}
