use crate::config::MonitorConfig;
use crate::device::registry::DeviceRegistry;
use compact_str::CompactString;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One health reading for one device.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub device_id: CompactString,
    pub timestamp: SystemTime,
    pub utilization_pct: f64,
    pub memory_used_gb: f64,
    pub temperature_c: Option<f64>,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type SampleHistory = HashMap<CompactString, VecDeque<PerformanceSample>>;

/// Background device-health sampler.
///
/// One monitor loop serves the whole process: it reads registry snapshots and
/// device-native utilization counters on a fixed interval and appends into a
/// bounded per-device ring buffer. A failed sample is dropped and the loop
/// continues at the next tick; the monitor never fails a pipeline.
pub struct PerformanceMonitor {
    registry: Arc<tokio::sync::RwLock<DeviceRegistry>>,
    history: Arc<RwLock<SampleHistory>>,
    capacity: usize,
    interval: Duration,
    running: Mutex<Option<MonitorTask>>,
}

impl PerformanceMonitor {
    pub fn new(registry: Arc<tokio::sync::RwLock<DeviceRegistry>>, config: &MonitorConfig) -> Self {
        Self {
            registry,
            history: Arc::new(RwLock::new(HashMap::new())),
            capacity: config.history_capacity.max(1),
            interval: config.sample_interval(),
            running: Mutex::new(None),
        }
    }

    /// Launch the sampling loop. Idempotent: calling while already running is
    /// a no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().expect("monitor lock poisoned");
        if running.is_some() {
            tracing::debug!("Performance monitor already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let history = Arc::clone(&self.history);
        let capacity = self.capacity;
        let sample_interval = self.interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sample_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sample_all(&registry, &history, capacity).await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Performance monitor loop exiting");
                        break;
                    }
                }
            }
        });

        *running = Some(MonitorTask { shutdown, task });
        tracing::info!("Performance monitor started (interval {sample_interval:?})");
    }

    /// Stop the sampling loop and wait for it to exit, bounded by a one
    /// second join timeout. Idempotent.
    pub async fn stop(&self) {
        let task = {
            let mut running = self.running.lock().expect("monitor lock poisoned");
            running.take()
        };

        let Some(MonitorTask { shutdown, task }) = task else {
            return;
        };

        let _ = shutdown.send(true);
        let abort = task.abort_handle();
        match tokio::time::timeout(Duration::from_secs(1), task).await {
            Ok(_) => tracing::info!("Performance monitor stopped"),
            Err(_) => {
                // Do not leave the loop running after a missed join.
                abort.abort();
                tracing::warn!("Performance monitor did not stop within 1s, aborted");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .expect("monitor lock poisoned")
            .is_some()
    }

    /// Copy of the current ring-buffer contents for one device. Never blocks
    /// the sampling loop beyond the read lock.
    pub fn snapshot(&self, device_id: &str) -> Vec<PerformanceSample> {
        self.history
            .read()
            .expect("monitor history lock poisoned")
            .get(device_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of all per-device sample histories.
    pub fn snapshot_all(&self) -> HashMap<CompactString, Vec<PerformanceSample>> {
        self.history
            .read()
            .expect("monitor history lock poisoned")
            .iter()
            .map(|(id, ring)| (id.clone(), ring.iter().cloned().collect()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn push_sample(&self, sample: PerformanceSample) {
        record(&self.history, self.capacity, sample);
    }
}

async fn sample_all(
    registry: &Arc<tokio::sync::RwLock<DeviceRegistry>>,
    history: &Arc<RwLock<SampleHistory>>,
    capacity: usize,
) {
    let registry = registry.read().await;
    for device in registry.snapshot() {
        match registry.sample(&device) {
            Some(reading) => record(
                history,
                capacity,
                PerformanceSample {
                    device_id: device.device_id.clone(),
                    timestamp: SystemTime::now(),
                    utilization_pct: reading.utilization_pct,
                    memory_used_gb: reading.memory_used_gb,
                    temperature_c: reading.temperature_c,
                },
            ),
            None => {
                // Transient read failure or a backend with no counters;
                // skip this tick and keep sampling.
                tracing::trace!("No utilization reading for {}", device.device_id);
            }
        }
    }
}

fn record(history: &Arc<RwLock<SampleHistory>>, capacity: usize, sample: PerformanceSample) {
    let mut history = history.write().expect("monitor history lock poisoned");
    let ring = history.entry(sample.device_id.clone()).or_default();
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::test_support::cpu;

    fn sample(n: u64) -> PerformanceSample {
        PerformanceSample {
            device_id: "cuda:0".into(),
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(n),
            utilization_pct: n as f64,
            memory_used_gb: 1.0,
            temperature_c: None,
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let registry = Arc::new(tokio::sync::RwLock::new(DeviceRegistry::with_devices(vec![
            cpu(16.0),
        ])));
        let monitor = PerformanceMonitor::new(
            registry,
            &MonitorConfig {
                sample_interval_secs: 1,
                history_capacity: 3,
            },
        );

        for n in 0..5 {
            monitor.push_sample(sample(n));
        }

        let samples = monitor.snapshot("cuda:0");
        assert_eq!(samples.len(), 3);
        // Oldest evicted silently: 0 and 1 are gone.
        assert_eq!(samples[0].utilization_pct, 2.0);
        assert_eq!(samples[2].utilization_pct, 4.0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_safe_twice() {
        let registry = Arc::new(tokio::sync::RwLock::new(DeviceRegistry::with_devices(vec![
            cpu(16.0),
        ])));
        let monitor = PerformanceMonitor::new(
            registry,
            &MonitorConfig {
                sample_interval_secs: 1,
                history_capacity: 10,
            },
        );

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop().await;
        assert!(!monitor.is_running());
        monitor.stop().await;
    }

    #[test]
    fn test_snapshot_of_unknown_device_is_empty() {
        let registry = Arc::new(tokio::sync::RwLock::new(DeviceRegistry::with_devices(vec![
            cpu(16.0),
        ])));
        let monitor = PerformanceMonitor::new(registry, &MonitorConfig::default());
        assert!(monitor.snapshot("cuda:7").is_empty());
    }
}
