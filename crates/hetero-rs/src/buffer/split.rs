use std::ops::Range;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{BackendError, BackendResult};
use crate::graph::TensorDesc;

use super::{size_overflow, BufferKind, BufferMemory, BufferStorage, BufferType, SplitSlice};

const RATIO_TOLERANCE: f32 = 1e-4;

/// Ordered device set with the fraction of rows each device receives.
///
/// Devices are strictly increasing by ordinal within one family and ratios sum to 1.0; both are
/// fixed once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSplit {
    devices: Vec<Device>,
    ratios: Vec<f32>,
}

impl TensorSplit {
    pub fn new(devices: Vec<Device>, ratios: Vec<f32>) -> BackendResult<Self> {
        if devices.is_empty() {
            return Err(BackendError::invalid_split("no devices"));
        }
        if devices.len() != ratios.len() {
            return Err(BackendError::invalid_split(format!(
                "{} ratios for {} devices",
                ratios.len(),
                devices.len()
            )));
        }
        for pair in devices.windows(2) {
            if pair[0].family() != pair[1].family() {
                return Err(BackendError::invalid_split(format!(
                    "devices {} and {} belong to different families",
                    pair[0], pair[1]
                )));
            }
            if pair[0].ordinal() >= pair[1].ordinal() {
                return Err(BackendError::invalid_split(format!(
                    "devices must be listed once each in ordinal order ({} before {})",
                    pair[0], pair[1]
                )));
            }
        }
        if let Some(bad) = ratios.iter().find(|r| !r.is_finite() || **r < 0.0) {
            return Err(BackendError::invalid_split(format!(
                "ratio {bad} must be finite and non-negative"
            )));
        }
        let total: f32 = ratios.iter().sum();
        if (total - 1.0).abs() > RATIO_TOLERANCE {
            return Err(BackendError::invalid_split(format!(
                "ratios sum to {total}, expected 1.0"
            )));
        }
        Ok(Self { devices, ratios })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn ratios(&self) -> &[f32] {
        &self.ratios
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.devices.contains(device)
    }

    /// Contiguous row ranges per device, in device order.
    ///
    /// Device `i` gets `round(ratio[i] * total_rows)` rows, capped by what is left; the last
    /// device takes the remainder so the ranges always cover exactly `total_rows`.
    pub fn partition_rows(&self, total_rows: usize) -> Vec<Range<usize>> {
        let last = self.ratios.len() - 1;
        let mut start = 0usize;
        let mut ranges = Vec::with_capacity(self.ratios.len());
        for (index, ratio) in self.ratios.iter().enumerate() {
            let remaining = total_rows - start;
            let rows = if index == last {
                remaining
            } else {
                ((f64::from(*ratio) * total_rows as f64).round() as usize).min(remaining)
            };
            ranges.push(start..start + rows);
            start += rows;
        }
        ranges
    }

    pub fn row_counts(&self, total_rows: usize) -> Vec<usize> {
        self.partition_rows(total_rows)
            .into_iter()
            .map(|range| range.len())
            .collect()
    }
}

/// Buffer type that partitions matrices by rows across several devices.
///
/// Tensors of rank below two are not split and live entirely on the main device. Reads or writes
/// that cross a partition boundary are the caller's job; nothing is gathered automatically.
pub struct SplitBufferType {
    name: String,
    main_device: Device,
    split: TensorSplit,
    device_types: Vec<Arc<dyn BufferType>>,
}

impl SplitBufferType {
    /// `device_types[i]` allocates the slice of `split.devices()[i]`.
    pub fn new(
        name: impl Into<String>,
        main_device: Device,
        split: TensorSplit,
        device_types: Vec<Arc<dyn BufferType>>,
    ) -> BackendResult<Self> {
        if device_types.len() != split.devices().len() {
            return Err(BackendError::invalid_split(format!(
                "{} device buffer types for {} devices",
                device_types.len(),
                split.devices().len()
            )));
        }
        if !split.contains(&main_device) {
            return Err(BackendError::invalid_split(format!(
                "main device {main_device} is not part of the split"
            )));
        }
        Ok(Self {
            name: name.into(),
            main_device,
            split,
            device_types,
        })
    }

    pub fn main_device(&self) -> &Device {
        &self.main_device
    }

    pub fn split(&self) -> &TensorSplit {
        &self.split
    }

    fn main_position(&self) -> usize {
        self.split
            .devices()
            .iter()
            .position(|device| *device == self.main_device)
            .unwrap_or(0)
    }
}

impl BufferType for SplitBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Split
    }

    fn alignment(&self) -> usize {
        self.device_types
            .iter()
            .map(|ty| ty.alignment())
            .max()
            .unwrap_or(1)
    }

    fn supports_device(&self, device: &Device) -> bool {
        self.split.contains(device)
    }

    fn alloc_memory(&self, size: usize) -> BackendResult<Box<dyn BufferMemory>> {
        Err(BackendError::allocation(
            &self.name,
            size,
            "split buffers need row geometry; allocate a tensor instead",
        ))
    }

    fn alloc_tensor_storage(&self, tensor: &TensorDesc) -> BackendResult<BufferStorage> {
        let byte_len = self.alloc_size(tensor)?;
        let overflow = || size_overflow(&self.name, tensor);
        let rows = tensor.rows().ok_or_else(overflow)?;
        let row_bytes = tensor.row_bytes().ok_or_else(overflow)?;

        if tensor.rank() < 2 {
            let main = self.main_position();
            let memory = self.device_types[main].alloc_memory(byte_len)?;
            return Ok(BufferStorage::Split(vec![SplitSlice {
                device: self.main_device.clone(),
                rows: 0..rows,
                memory,
            }]));
        }

        let mut slices = Vec::with_capacity(self.device_types.len());
        let ranges = self.split.partition_rows(rows);
        for ((device, buffer_type), range) in self
            .split
            .devices()
            .iter()
            .zip(&self.device_types)
            .zip(ranges)
        {
            if range.is_empty() {
                continue;
            }
            let size = range.len().checked_mul(row_bytes).ok_or_else(overflow)?;
            let memory = buffer_type.alloc_memory(size)?;
            slices.push(SplitSlice {
                device: device.clone(),
                rows: range,
                memory,
            });
        }
        Ok(BufferStorage::Split(slices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn gpus(n: usize) -> Vec<Device> {
        (0..n).map(|i| Device::new("sim", i, DeviceKind::Gpu)).collect()
    }

    #[test]
    fn rounding_overflow_is_capped() {
        // round(0.5 * 3) = 2 for both devices; the second must take only what is left.
        let split = TensorSplit::new(gpus(2), vec![0.5, 0.5]).unwrap();
        assert_eq!(split.row_counts(3), vec![2, 1]);
    }

    #[test]
    fn rejects_malformed_splits() {
        assert!(TensorSplit::new(gpus(2), vec![0.5]).is_err());
        assert!(TensorSplit::new(gpus(2), vec![0.6, 0.6]).is_err());
        assert!(TensorSplit::new(gpus(2), vec![-0.5, 1.5]).is_err());
        let mut reversed = gpus(2);
        reversed.reverse();
        assert!(TensorSplit::new(reversed, vec![0.5, 0.5]).is_err());
        let repeated = vec![gpus(1)[0].clone(), gpus(1)[0].clone()];
        assert!(TensorSplit::new(repeated, vec![0.5, 0.5]).is_err());
    }
}
