//! # Device Detection and Management
//!
//! Maps the configured device and compute-precision strings onto candle
//! devices and dtypes. A preferred accelerator that is not available falls back
//! to the CPU with a warning instead of failing the worker.

use candle_core::{DType, Device};
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached best available device to avoid repeated detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    Cpu,
    /// Falls back to CPU if not available
    Cuda,
    /// Falls back to CPU if not available
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Numeric precision the engine weights are loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputePrecision {
    Float32,
    Float16,
    BFloat16,
}

impl std::str::FromStr for ComputePrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(ComputePrecision::Float32),
            "float16" | "fp16" | "f16" => Ok(ComputePrecision::Float16),
            "bfloat16" | "bf16" => Ok(ComputePrecision::BFloat16),
            // Quantized compute is not available for the candle Whisper model.
            "int8" | "int8_float16" => {
                warn!("Compute type '{}' not supported, using float32", s);
                Ok(ComputePrecision::Float32)
            }
            _ => Err(format!("Unknown compute type: {}", s)),
        }
    }
}

impl ComputePrecision {
    /// Half precision only pays off on an accelerator; on the CPU it is
    /// emulated and slow, so the CPU always runs at float32.
    pub fn dtype_for(&self, device: &Device) -> DType {
        match (self, device) {
            (_, Device::Cpu) => DType::F32,
            (ComputePrecision::Float32, _) => DType::F32,
            (ComputePrecision::Float16, _) => DType::F16,
            (ComputePrecision::BFloat16, _) => DType::BF16,
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Get the best available device based on preference
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but not available, falling back to CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or_else(|| {
                warn!("Metal requested but not available, falling back to CPU");
                Device::Cpu
            }),
        }
    }

    /// Get the best available device (cached)
    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for inference");
            return metal_device;
        }

        info!("Using CPU for inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU (Apple Silicon)".to_string(),
        }
    }

    pub fn get_device_summary() -> DeviceSummary {
        let cuda_available = Self::get_cuda_device().is_some();
        let metal_available = Self::get_metal_device().is_some();
        DeviceSummary {
            cuda_available,
            metal_available,
            gpu_available: cuda_available || metal_available,
            current_device: Self::get_device_info(&Self::get_best_device()),
        }
    }
}

/// Device availability summary
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub cuda_available: bool,
    pub metal_available: bool,
    pub gpu_available: bool,
    pub current_device: String,
}

/// Create a device based on string preference with fallback
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::get_device(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::get_best_device()
        }
    }
}
