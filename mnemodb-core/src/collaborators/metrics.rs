/// Host resource readings consulted by the maintenance scheduler.

use parking_lot::RwLock;

pub trait ResourceMetrics: Send + Sync {
    /// CPU load in [0, 1].
    fn cpu_load(&self) -> f32;

    fn memory_used_bytes(&self) -> u64;
}

/// Fixed readings, adjustable at runtime. The default reports an idle host.
#[derive(Debug, Default)]
pub struct StaticMetrics {
    readings: RwLock<(f32, u64)>,
}

impl StaticMetrics {
    pub fn new(cpu_load: f32, memory_used_bytes: u64) -> Self {
        StaticMetrics {
            readings: RwLock::new((cpu_load, memory_used_bytes)),
        }
    }

    pub fn set_cpu_load(&self, cpu_load: f32) {
        self.readings.write().0 = cpu_load;
    }

    pub fn set_memory_used(&self, bytes: u64) {
        self.readings.write().1 = bytes;
    }
}

impl ResourceMetrics for StaticMetrics {
    fn cpu_load(&self) -> f32 {
        self.readings.read().0
    }

    fn memory_used_bytes(&self) -> u64 {
        self.readings.read().1
    }
}
