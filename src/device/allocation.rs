use crate::device::capabilities::{DeviceCapabilities, WorkloadProfile};
use compact_str::CompactString;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

/// One live memory reservation against a device.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub device_id: CompactString,
    pub workload_id: CompactString,
    pub reserved_gb: f64,
    pub created_at: SystemTime,
}

/// Admission control for device memory.
///
/// This is the only structure mutated from multiple tasks (concurrent
/// pipeline runs), so all access is serialized through one mutex. Invariant:
/// for every device, the sum of live reservations never exceeds the device's
/// available memory as seen at reserve time.
#[derive(Default)]
pub struct AllocationTracker {
    allocations: Mutex<Vec<Allocation>>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve memory for a workload. Returns false when the reservation
    /// would oversubscribe the device; the caller treats that as
    /// `InsufficientMemory`.
    pub fn reserve(
        &self,
        device: &DeviceCapabilities,
        workload: &WorkloadProfile,
        workload_id: &str,
    ) -> bool {
        let mut allocations = self.allocations.lock().expect("allocation lock poisoned");

        let current: f64 = allocations
            .iter()
            .filter(|a| a.device_id == device.device_id)
            .map(|a| a.reserved_gb)
            .sum();

        if current + workload.memory_requirement_gb > device.memory_available_gb {
            tracing::warn!(
                "Reservation refused on {}: {current:.2}GB held + {:.2}GB requested > {:.2}GB available",
                device.device_id,
                workload.memory_requirement_gb,
                device.memory_available_gb
            );
            return false;
        }

        allocations.push(Allocation {
            device_id: device.device_id.clone(),
            workload_id: workload_id.into(),
            reserved_gb: workload.memory_requirement_gb,
            created_at: SystemTime::now(),
        });
        tracing::info!(
            "Reserved {:.2}GB on {} for {workload_id} ({:.2}GB now held)",
            workload.memory_requirement_gb,
            device.device_id,
            current + workload.memory_requirement_gb
        );
        true
    }

    /// Release a reservation. Idempotent: releasing something never reserved
    /// is a no-op, so failure paths can always release defensively.
    pub fn release(&self, device_id: &str, workload_id: &str) {
        let mut allocations = self.allocations.lock().expect("allocation lock poisoned");
        let before = allocations.len();
        allocations.retain(|a| !(a.device_id == device_id && a.workload_id == workload_id));
        if allocations.len() < before {
            tracing::info!("Released allocation on {device_id} for {workload_id}");
        }
    }

    /// Total reserved memory on one device.
    pub fn allocated_gb(&self, device_id: &str) -> f64 {
        self.allocations
            .lock()
            .expect("allocation lock poisoned")
            .iter()
            .filter(|a| a.device_id == device_id)
            .map(|a| a.reserved_gb)
            .sum()
    }

    /// Per-device reservation totals for status reporting.
    pub fn totals(&self) -> HashMap<CompactString, f64> {
        let allocations = self.allocations.lock().expect("allocation lock poisoned");
        let mut totals: HashMap<CompactString, f64> = HashMap::new();
        for allocation in allocations.iter() {
            *totals.entry(allocation.device_id.clone()).or_insert(0.0) += allocation.reserved_gb;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::capabilities::TaskType;
    use crate::device::registry::test_support::gpu;

    fn workload(memory_gb: f64) -> WorkloadProfile {
        WorkloadProfile::builder(TaskType::VideoEncode)
            .memory_requirement_gb(memory_gb)
            .build()
    }

    #[test]
    fn test_reserve_respects_capacity() {
        let tracker = AllocationTracker::new();
        let device = gpu(0, 8.0, 5.0, true);

        assert!(tracker.reserve(&device, &workload(4.0), "job-1"));
        assert!(tracker.reserve(&device, &workload(4.0), "job-2"));
        // Third reservation would exceed the 8GB available.
        assert!(!tracker.reserve(&device, &workload(0.5), "job-3"));
        assert_eq!(tracker.allocated_gb("cuda:0"), 8.0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let tracker = AllocationTracker::new();
        let device = gpu(0, 8.0, 5.0, true);

        assert!(tracker.reserve(&device, &workload(2.0), "job-1"));
        tracker.release("cuda:0", "job-1");
        tracker.release("cuda:0", "job-1");
        tracker.release("cuda:0", "never-reserved");
        assert_eq!(tracker.allocated_gb("cuda:0"), 0.0);
    }

    #[test]
    fn test_invariant_under_concurrent_reservations() {
        use std::sync::Arc;

        let tracker = Arc::new(AllocationTracker::new());
        let device = Arc::new(gpu(0, 8.0, 5.0, true));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                let device = Arc::clone(&device);
                std::thread::spawn(move || tracker.reserve(&device, &workload(1.0), &format!("job-{i}")))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();

        // Exactly 8 of the 16 one-GB requests fit in 8GB.
        assert_eq!(granted, 8);
        assert!(tracker.allocated_gb("cuda:0") <= 8.0);
    }

    #[test]
    fn test_totals_by_device() {
        let tracker = AllocationTracker::new();
        let gpu0 = gpu(0, 8.0, 5.0, true);
        let gpu1 = gpu(1, 8.0, 5.0, true);

        assert!(tracker.reserve(&gpu0, &workload(2.0), "job-1"));
        assert!(tracker.reserve(&gpu1, &workload(3.0), "job-2"));

        let totals = tracker.totals();
        assert_eq!(totals.get("cuda:0").copied(), Some(2.0));
        assert_eq!(totals.get("cuda:1").copied(), Some(3.0));
    }
}
