use anyhow::{anyhow, Result};
use candle_core::utils::metal_is_available;
use candle_core::Device;

/// Converts a device string to a Candle Device.
///
/// # Supported Device Strings
///
/// - `"cpu"`: the CPU device
/// - `"cuda"`: the default CUDA device (index 0)
/// - `"cuda:N"`: the CUDA device with the given index
/// - `"metal"`: the default Metal device
///
/// # Errors
///
/// Fails when the requested accelerator is not available or the string names
/// an unknown device type.
pub fn get_device(device_str: &str) -> Result<Device> {
    if device_str.starts_with("cuda") {
        let cuda_index = if device_str == "cuda" {
            0
        } else {
            device_str
                .split(':')
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow!("Invalid CUDA device string: {}", device_str))?
        };

        let device = Device::cuda_if_available(cuda_index)?;
        if !device.is_cuda() {
            return Err(anyhow!("CUDA device {} is not available", cuda_index));
        }
        Ok(device)
    } else {
        match device_str {
            "cpu" => Ok(Device::Cpu),
            "metal" if metal_is_available() => Ok(Device::new_metal(0)?),
            "metal" => Err(anyhow!("Metal device is not available")),
            _ => Err(anyhow!("Unsupported device type: {}", device_str)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_device() {
        let device = get_device("cpu").unwrap();
        assert!(matches!(device, Device::Cpu));

        assert!(get_device("tpu").is_err());

        if !candle_core::utils::cuda_is_available() {
            assert!(get_device("cuda:0").is_err());
        }
    }
}
