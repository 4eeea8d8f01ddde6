use crate::model::{now_unix, CpuSample, DiskSample, MemorySample, NetSample, ResourceSample};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::time::Duration;
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

const SECTOR_SIZE: u64 = 512;

/// Blocking: sleeps for `cpu_window` between the two CPU refreshes, so
/// callers run it on the blocking pool.
pub fn collect_system(system: &mut System, cpu_window: Duration) -> ResourceSample {
    system.refresh_cpu();
    std::thread::sleep(cpu_window.max(System::MINIMUM_CPU_UPDATE_INTERVAL));
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_networks_list();
    system.refresh_networks();

    let cpu = collect_cpu(system);
    let memory = collect_memory(system);
    let disks = collect_disks(system, &read_disk_io());
    let network = collect_network(system);
    debug!(
        cpu = cpu.usage_percent,
        memory = memory.used_percent,
        disks = disks.len(),
        ifaces = network.len(),
        "system sample collected"
    );

    ResourceSample {
        cpu,
        memory,
        disks,
        network,
        uptime_seconds: system.uptime(),
        sampled_at_unix: now_unix(),
    }
}

fn collect_cpu(system: &System) -> CpuSample {
    let cpus = system.cpus();
    let per_core_percent: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();
    let usage_percent = if cpus.is_empty() {
        0.0
    } else {
        system.global_cpu_info().cpu_usage() as f64
    };
    let first = cpus.first();

    CpuSample {
        usage_percent,
        per_core_percent,
        model_name: first.map(|c| c.brand().trim().to_string()).unwrap_or_default(),
        frequency_mhz: first.map(|c| c.frequency()).unwrap_or(0),
        physical_cores: system.physical_core_count().unwrap_or(cpus.len()),
        logical_cores: cpus.len(),
    }
}

fn collect_memory(system: &System) -> MemorySample {
    let total = system.total_memory();
    let used = system.used_memory();
    let swap_total = system.total_swap();
    let swap_used = system.used_swap();

    MemorySample {
        total_bytes: total,
        used_bytes: used,
        free_bytes: system.free_memory(),
        available_bytes: system.available_memory(),
        used_percent: percent(used, total),
        swap_total_bytes: swap_total,
        swap_used_bytes: swap_used,
        swap_free_bytes: system.free_swap(),
        swap_percent: percent(swap_used, swap_total),
    }
}

fn collect_disks(system: &System, io: &HashMap<String, (u64, u64)>) -> Vec<DiskSample> {
    system
        .disks()
        .iter()
        .filter(|d| d.total_space() > 0)
        .map(|d| {
            let device = d.name().to_string_lossy().to_string();
            let total = d.total_space();
            let free = d.available_space();
            let used = total.saturating_sub(free);
            let (read_bytes, write_bytes) = io.get(device_key(&device)).copied().unwrap_or((0, 0));
            DiskSample {
                device,
                mount_point: d.mount_point().to_string_lossy().to_string(),
                fs_type: String::from_utf8_lossy(d.file_system()).to_string(),
                total_bytes: total,
                used_bytes: used,
                free_bytes: free,
                used_percent: percent(used, total),
                read_bytes,
                write_bytes,
            }
        })
        .collect()
}

fn collect_network(system: &System) -> Vec<NetSample> {
    let mut out: Vec<NetSample> = system
        .networks()
        .iter()
        .map(|(iface, data)| NetSample {
            iface: iface.to_string(),
            bytes_sent: data.total_transmitted(),
            bytes_recv: data.total_received(),
            packets_sent: data.total_packets_transmitted(),
            packets_recv: data.total_packets_received(),
            errors_in: data.total_errors_on_received(),
            errors_out: data.total_errors_on_transmitted(),
        })
        .filter(is_reportable_iface)
        .collect();
    out.sort_by(|a, b| a.iface.cmp(&b.iface));
    out
}

/// Loopback is noise outside Windows; idle interfaces with no traffic at
/// all are dropped everywhere.
pub fn is_reportable_iface(sample: &NetSample) -> bool {
    if !cfg!(target_os = "windows") && sample.iface == "lo" {
        return false;
    }
    sample.bytes_sent > 0 || sample.bytes_recv > 0
}

pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn device_key(device: &str) -> &str {
    Path::new(device)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(device)
}

#[cfg(target_os = "linux")]
fn read_disk_io() -> HashMap<String, (u64, u64)> {
    match fs::read_to_string("/proc/diskstats") {
        Ok(text) => parse_diskstats(&text),
        Err(err) => {
            debug!(error = %err, "diskstats unavailable");
            HashMap::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_disk_io() -> HashMap<String, (u64, u64)> {
    HashMap::new()
}

/// Device name to `(read_bytes, write_bytes)` from `/proc/diskstats`.
pub fn parse_diskstats(text: &str) -> HashMap<String, (u64, u64)> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let sectors_read = fields[5].parse::<u64>().ok()?;
            let sectors_written = fields[9].parse::<u64>().ok()?;
            Some((
                fields[2].to_string(),
                (
                    sectors_read.saturating_mul(SECTOR_SIZE),
                    sectors_written.saturating_mul(SECTOR_SIZE),
                ),
            ))
        })
        .collect()
}
