//! Observability utilities: GPU and host system metrics, exported through
//! the same `prometheus` registry the API layer scrapes at `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("kv_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("kv_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> =
    Lazy::new(|| prometheus::register_gauge!("kv_gpu_temperature_celsius", "GPU temperature in C").unwrap());
static CPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("kv_cpu_utilization", "Host CPU utilization percent").unwrap());
static MEM_USED: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("kv_host_memory_bytes", "Host memory used (bytes)").unwrap());

pub fn init() {
    // Touch statics to ensure registration and avoid dead_code warnings when NVML is disabled.
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
    let _ = &*CPU_UTIL;
    let _ = &*MEM_USED;
}

pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::NVML::init() {
            Ok(n) => n,
            Err(_) => return,
        };
        let device = match nvml.device_by_index(0) {
            Ok(d) => d,
            Err(_) => return,
        };
        loop {
            if let Ok(util) = device.utilization_rates() {
                GPU_UTIL.set(util.gpu as f64);
            }
            if let Ok(mem) = device.memory_info() {
                GPU_MEM_USED.set(mem.used as i64);
            }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) {
                GPU_TEMP.set(temp as f64);
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

/// Polls host CPU/memory via `sysinfo` and republishes as gauges. Runs
/// regardless of GPU availability, since every deployment has a host to
/// watch even when it has no NVML device.
pub fn spawn_system_polling() {
    tokio::spawn(async move {
        use sysinfo::{CpuExt, System, SystemExt};
        let mut sys = System::new_all();
        loop {
            sys.refresh_cpu();
            sys.refresh_memory();
            let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len().max(1) as f32);
            CPU_UTIL.set(cpu_avg as f64);
            MEM_USED.set(sys.used_memory() as i64);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    });
}
