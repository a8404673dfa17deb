// src/device.rs
use tch::{nn, Cuda, Device, Kind, Tensor};

/// The accelerators this process may use.
///
/// Holds at most `num_gpus` CUDA devices. With none available every query
/// degrades to the CPU.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    gpus: Vec<Device>,
}

impl DeviceManager {
    pub fn new(requested_gpus: usize) -> Self {
        let available = if Cuda::is_available() { Cuda::device_count().max(0) as usize } else { 0 };
        let n = requested_gpus.min(available);
        tracing::info!("# number of gpus {} (requested {}, available {})", n, requested_gpus, available);
        Self { gpus: (0..n).map(Device::Cuda).collect() }
    }

    pub fn cpu_only() -> Self {
        Self { gpus: Vec::new() }
    }

    /// Manager over an explicit device list, mostly for placement planning.
    pub fn from_devices(gpus: Vec<Device>) -> Self {
        Self { gpus }
    }

    pub fn num_available_gpus(&self) -> usize {
        self.gpus.len()
    }

    /// Devices parameters can be placed on; never empty.
    pub fn devices(&self) -> Vec<Device> {
        if self.gpus.is_empty() {
            vec![Device::Cpu]
        } else {
            self.gpus.clone()
        }
    }

    pub fn head(&self) -> Device {
        self.gpus.first().copied().unwrap_or(Device::Cpu)
    }

    pub fn tail(&self) -> Device {
        self.gpus.last().copied().unwrap_or(Device::Cpu)
    }
}

/// Round-robin placement of layers over the managed devices.
///
/// Successive `assign` calls continue where the previous one stopped unless a
/// `base` offset is given, so consecutive components spread over the devices.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    devices: Vec<Device>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new(manager: &DeviceManager) -> Self {
        Self { devices: manager.devices(), cursor: 0 }
    }

    pub fn assign(&mut self, n: usize, base: Option<usize>) -> Vec<Device> {
        let len = self.devices.len();
        if len <= 1 {
            return vec![self.devices[0]; n];
        }
        let start = base.unwrap_or(self.cursor) % len;
        let assigned = (0..n).map(|i| self.devices[(start + i) % len]).collect();
        self.cursor = (start + n) % len;
        assigned
    }
}

/// One variable store per device so a pinned layer owns its weights there.
pub struct ParamStores {
    stores: Vec<nn::VarStore>,
}

impl ParamStores {
    pub fn new(manager: &DeviceManager) -> Self {
        let stores = manager
            .devices()
            .into_iter()
            .map(|device| {
                let mut vs = nn::VarStore::new(device);
                vs.set_kind(Kind::Float);
                vs
            })
            .collect();
        Self { stores }
    }

    pub fn cpu() -> Self {
        Self::new(&DeviceManager::cpu_only())
    }

    fn store_for(&self, device: Device) -> &nn::VarStore {
        self.stores
            .iter()
            .find(|vs| vs.device() == device)
            .unwrap_or(&self.stores[0])
    }

    /// Path under `scope` ('/'-separated) in the store that lives on `device`.
    /// Unknown devices fall back to the first store.
    pub fn scoped(&self, device: Device, scope: &str) -> nn::Path<'_> {
        scope
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.store_for(device).root(), |path, name| path.sub(name))
    }

    pub fn stores(&self) -> &[nn::VarStore] {
        &self.stores
    }

    pub fn stores_mut(&mut self) -> &mut [nn::VarStore] {
        &mut self.stores
    }

    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.stores.iter().flat_map(|vs| vs.trainable_variables()).collect()
    }

    pub fn num_parameters(&self) -> i64 {
        self.trainable_variables().iter().map(|t| t.size().iter().product::<i64>()).sum()
    }

    /// Every named variable with the device it lives on, sorted by name.
    pub fn describe(&self) -> Vec<(String, Vec<i64>, Device)> {
        let mut out: Vec<_> = self
            .stores
            .iter()
            .flat_map(|vs| {
                vs.variables()
                    .into_iter()
                    .map(move |(name, t)| (name, t.size(), vs.device()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
