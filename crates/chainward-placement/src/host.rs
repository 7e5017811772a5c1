//! Host resource sampling.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{Disks, System};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Snapshot of host capacity. Sizes are in GiB.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HostResources {
    pub disk_total_gb: f64,
    pub disk_available_gb: f64,
    pub memory_total_gb: f64,
    pub memory_available_gb: f64,
    pub cpu_percent: f64,
}

impl HostResources {
    pub fn disk_used_percent(&self) -> f64 {
        used_percent(self.disk_total_gb, self.disk_available_gb)
    }

    pub fn memory_used_percent(&self) -> f64 {
        used_percent(self.memory_total_gb, self.memory_available_gb)
    }
}

fn used_percent(total: f64, available: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    ((total - available) / total * 100.0).clamp(0.0, 100.0)
}

/// Source of host resource figures. Disk figures are for the filesystem
/// holding `path`.
pub trait HostProbe: Send + Sync {
    fn sample(&self, path: &Path) -> HostResources;
}

/// Reads the real host through sysinfo.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self, path: &Path) -> HostResources {
        let (memory_total, memory_available, cpu) = {
            let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
            system.refresh_memory();
            // CPU usage is the delta since the previous refresh.
            system.refresh_cpu_usage();
            (
                system.total_memory(),
                system.available_memory(),
                f64::from(system.global_cpu_usage()),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64, u64)> = disks
            .list()
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.total_space(), d.available_space()))
            .collect();
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let (disk_total, disk_available) = pick_mount(&target, &mounts).unwrap_or((0, 0));

        HostResources {
            disk_total_gb: disk_total as f64 / GIB,
            disk_available_gb: disk_available as f64 / GIB,
            memory_total_gb: memory_total as f64 / GIB,
            memory_available_gb: memory_available as f64 / GIB,
            cpu_percent: cpu,
        }
    }
}

/// Total/available bytes of the mount with the longest prefix of `path`.
fn pick_mount(path: &Path, mounts: &[(PathBuf, u64, u64)]) -> Option<(u64, u64)> {
    mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, avail)| (*total, *avail))
}

/// A host with fixed, adjustable figures.
#[derive(Debug, Default)]
pub struct FixedHost(Mutex<HostResources>);

impl FixedHost {
    pub fn new(resources: HostResources) -> Self {
        Self(Mutex::new(resources))
    }

    pub fn set(&self, resources: HostResources) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = resources;
    }

    pub fn update(&self, f: impl FnOnce(&mut HostResources)) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut *guard);
    }
}

impl HostProbe for FixedHost {
    fn sample(&self, _path: &Path) -> HostResources {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_mount_prefix_wins() {
        let mounts = vec![
            (PathBuf::from("/"), 100, 50),
            (PathBuf::from("/var"), 200, 20),
            (PathBuf::from("/var/lib/chainward"), 1000, 900),
            (PathBuf::from("/var/lib/chain"), 5, 5),
        ];
        assert_eq!(pick_mount(Path::new("/var/lib/chainward/btc-1"), &mounts), Some((1000, 900)));
        assert_eq!(pick_mount(Path::new("/var/log"), &mounts), Some((200, 20)));
        assert_eq!(pick_mount(Path::new("/home"), &mounts), Some((100, 50)));
        assert_eq!(pick_mount(Path::new("/home"), &[]), None);
    }

    #[test]
    fn used_percent_handles_empty_totals() {
        let host = HostResources {
            disk_total_gb: 100.0,
            disk_available_gb: 10.0,
            ..Default::default()
        };
        assert!((host.disk_used_percent() - 90.0).abs() < 1e-9);
        assert_eq!(host.memory_used_percent(), 0.0);
    }
}
