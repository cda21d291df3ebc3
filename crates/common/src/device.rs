//! Explicit compute placement.
//!
//! The device is chosen once by the caller (usually the binary) and passed
//! to every loop. Nothing in the workspace discovers it on its own.

use candle_core::{Device, Tensor};

/// A device request as written on the command line or in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// CUDA ordinal 0 when available, CPU otherwise.
    Auto,
}

impl DeviceSpec {
    /// Parse `cpu`, `auto`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((k, n)) => {
                let n: usize = n
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid device ordinal in {s:?}"))?;
                (k.to_string(), n)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => anyhow::bail!("unknown device {s:?} (expected cpu, auto, cuda[:N], metal[:N])"),
        }
    }

    /// Build the candle device. Fails if the backend is not compiled in.
    pub fn resolve(self) -> candle_core::Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(n) => Device::new_cuda(n)?,
            Self::Metal(n) => Device::new_metal(n)?,
            Self::Auto => Device::cuda_if_available(0)?,
        };
        tracing::info!(device = ?device.location(), "resolved compute device");
        Ok(device)
    }
}

/// Move an `(inputs, targets)` batch onto `device` (no-op when already there).
pub fn place_batch(
    inputs: &Tensor,
    targets: &Tensor,
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    Ok((inputs.to_device(device)?, targets.to_device(device)?))
}

// ── Tests ───────────────────────────────────────────────────────────────────
