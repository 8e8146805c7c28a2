use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            info!("no accelerator available, running on CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Label of the compute backend generation would run on, for the health
/// endpoint. Honors a forced CPU mapping even when an accelerator is
/// available; reflects the configuration, not whether a model is loaded yet.
pub fn accelerator_label(device_map: DeviceMap) -> &'static str {
    match device_map {
        DeviceMap::ForceCpu => "cpu",
        DeviceMap::Ordinal(_) if cuda_is_available() => "cuda",
        DeviceMap::Ordinal(_) if metal_is_available() => "metal",
        DeviceMap::Ordinal(_) => "cpu",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_cpu_always_yields_cpu() {
        let device = select_best_device(DeviceMap::ForceCpu).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn forced_cpu_is_labelled_cpu_regardless_of_accelerators() {
        assert_eq!(accelerator_label(DeviceMap::ForceCpu), "cpu");
    }
}
