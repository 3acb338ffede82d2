use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::{BackendFamily, BackendHandle};
use crate::buffer::{BufferType, HostRegistration, SplitBufferType, TensorSplit};
use crate::device::{check_ordinal, Device, DeviceKind, DeviceQuery, MemoryInfo};
use crate::env::{normalize_weights, BackendConfig};
use crate::error::{BackendError, BackendResult};

use super::backend::{AcceleratorBackend, EmptyKernelSet, KernelSet};
use super::buffer::{DeviceBufferType, HostPins, PinnedHostBufferType};
use super::driver::{AcceleratorDriver, MAX_DEVICES};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SplitKey {
    main_device: usize,
    ratio_bits: Vec<u32>,
}

/// Backend family over any [`AcceleratorDriver`].
///
/// Device names are captured once at construction. Buffer types are created on first request
/// and memoized, so repeated lookups return the same `Arc` and never touch the driver.
pub struct AcceleratorFamily {
    name: String,
    driver: Arc<dyn AcceleratorDriver>,
    kernels: Arc<dyn KernelSet>,
    descriptions: Vec<String>,
    device_types: Vec<OnceLock<Arc<dyn BufferType>>>,
    host_type: OnceLock<Arc<dyn BufferType>>,
    split_types: Mutex<HashMap<SplitKey, Arc<dyn BufferType>>>,
    pins: Arc<HostPins>,
}

impl AcceleratorFamily {
    pub fn new(driver: Arc<dyn AcceleratorDriver>, config: &BackendConfig) -> BackendResult<Self> {
        let reported = driver.device_count()?;
        if reported > MAX_DEVICES {
            tracing::warn!(
                driver = driver.name(),
                reported,
                "driver reports more devices than supported; using the first {MAX_DEVICES}"
            );
        }
        let count = reported.min(MAX_DEVICES);
        let descriptions = (0..count)
            .map(|ordinal| match driver.device_name(ordinal) {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(driver = driver.name(), ordinal, "device name unavailable: {err}");
                    format!("{} device {ordinal}", driver.name())
                }
            })
            .collect::<Vec<_>>();
        for (ordinal, description) in descriptions.iter().enumerate() {
            tracing::info!(driver = driver.name(), ordinal, "found device: {description}");
        }

        Ok(Self {
            name: driver.name().to_string(),
            kernels: Arc::new(EmptyKernelSet),
            device_types: (0..count).map(|_| OnceLock::new()).collect(),
            host_type: OnceLock::new(),
            split_types: Mutex::new(HashMap::new()),
            pins: Arc::new(HostPins::new(Arc::clone(&driver), config.register_host)),
            descriptions,
            driver,
        })
    }

    /// Installs the native kernels used by backends created afterwards.
    pub fn with_kernels(mut self, kernels: Arc<dyn KernelSet>) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn driver(&self) -> &Arc<dyn AcceleratorDriver> {
        &self.driver
    }

    pub fn host_pins(&self) -> &Arc<HostPins> {
        &self.pins
    }

    fn check_device(&self, device: &Device) -> BackendResult<()> {
        if device.family() != self.name || device.ordinal() >= self.count() {
            return Err(BackendError::device_unavailable(
                device,
                format!("{} enumerates {} devices", self.name, self.count()),
            ));
        }
        Ok(())
    }
}

impl DeviceQuery for AcceleratorFamily {
    fn count(&self) -> usize {
        self.descriptions.len()
    }

    fn describe(&self, ordinal: usize) -> String {
        check_ordinal(&self.name, ordinal, self.count());
        self.descriptions[ordinal].clone()
    }

    fn memory(&self, ordinal: usize) -> MemoryInfo {
        check_ordinal(&self.name, ordinal, self.count());
        self.driver.memory_info(ordinal).unwrap_or_else(|err| {
            tracing::warn!(driver = %self.name, ordinal, "memory query failed: {err}");
            MemoryInfo::default()
        })
    }
}

impl BackendFamily for AcceleratorFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    #[tracing::instrument(level = "debug", skip(self), fields(family = %self.name))]
    fn init_backend(&self, device: &Device) -> BackendResult<BackendHandle> {
        self.check_device(device)?;
        self.driver
            .init_device(device.ordinal())
            .map_err(|err| BackendError::device_unavailable(device, err.to_string()))?;
        Ok(BackendHandle::new(Box::new(AcceleratorBackend::new(
            device.clone(),
            Arc::clone(&self.driver),
            Arc::clone(&self.kernels),
        ))))
    }

    fn device_buffer_type(&self, device: &Device) -> BackendResult<Arc<dyn BufferType>> {
        self.check_device(device)?;
        let slot = &self.device_types[device.ordinal()];
        let buffer_type = slot.get_or_init(|| -> Arc<dyn BufferType> {
            Arc::new(DeviceBufferType::new(device.clone(), Arc::clone(&self.driver)))
        });
        Ok(Arc::clone(buffer_type))
    }

    fn host_buffer_type(&self) -> Option<Arc<dyn BufferType>> {
        let buffer_type = self.host_type.get_or_init(|| -> Arc<dyn BufferType> {
            Arc::new(PinnedHostBufferType::new(Arc::clone(&self.driver)))
        });
        Some(Arc::clone(buffer_type))
    }

    fn split_buffer_type(
        &self,
        main_device: &Device,
        ratios: &[f32],
    ) -> BackendResult<Arc<dyn BufferType>> {
        self.check_device(main_device)?;
        let count = self.count();
        if ratios.len() > count {
            return Err(BackendError::invalid_split(format!(
                "{} ratios for {count} {} devices",
                ratios.len(),
                self.name
            )));
        }
        let mut weights = ratios.to_vec();
        weights.resize(count, 0.0);
        let normalized = normalize_weights(&weights)?;

        let key = SplitKey {
            main_device: main_device.ordinal(),
            ratio_bits: normalized.iter().map(|r| r.to_bits()).collect(),
        };
        let mut split_types = self.split_types.lock().expect("split type cache poisoned");
        if let Some(existing) = split_types.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let split = TensorSplit::new(self.devices(), normalized)?;
        let device_types = split
            .devices()
            .iter()
            .map(|device| self.device_buffer_type(device))
            .collect::<BackendResult<Vec<_>>>()?;
        let buffer_type: Arc<dyn BufferType> = Arc::new(SplitBufferType::new(
            format!("{}_Split", self.name.to_ascii_uppercase()),
            main_device.clone(),
            split,
            device_types,
        )?);
        tracing::debug!(family = %self.name, main = %main_device, ?ratios, "created split buffer type");
        split_types.insert(key, Arc::clone(&buffer_type));
        Ok(buffer_type)
    }

    fn register_host_buffer<'a>(&self, region: &'a mut [u8]) -> BackendResult<HostRegistration<'a>> {
        self.pins.pin(region)
    }
}
