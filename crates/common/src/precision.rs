//! Numeric precision selection (`--dtype`).

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};

/// Compute precision for the forward pass. Parameters always stay f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    /// Reduced-width formats need loss scaling.
    pub fn is_reduced(self) -> bool {
        !matches!(self, Self::F32)
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }

    /// Dtype matmuls actually run in: reduced only on accelerators, CPU stays f32.
    pub fn autocast_dtype(self, device: &Device) -> DType {
        if device.is_cpu() {
            DType::F32
        } else {
            self.dtype()
        }
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" | "f32" => Ok(Self::F32),
            "float16" | "f16" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            other => anyhow::bail!("unknown dtype {other:?} (expected float32, float16 or bfloat16)"),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_torch_style_names() {
        assert_eq!("bfloat16".parse::<Precision>().unwrap(), Precision::BF16);
        assert_eq!("float16".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::F32);
        assert!("int8".parse::<Precision>().is_err());
    }

    #[test]
    fn cpu_never_autocasts() {
        assert_eq!(Precision::BF16.autocast_dtype(&Device::Cpu), DType::F32);
        assert!(Precision::BF16.is_reduced());
        assert!(!Precision::F32.is_reduced());
    }
}
