use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};

use crate::core::resource::{ResourceProbe, ResourceSnapshot};

/// Reads live memory, disk and CPU figures through `sysinfo`.
///
/// Storage is measured on the disk whose mount point is the longest prefix
/// of `storage_path`.
pub struct SystemProbe {
    system: Mutex<System>,
    storage_path: PathBuf,
}

impl SystemProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let system = System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
        Self {
            system: Mutex::new(system),
            storage_path: storage_path.into(),
        }
    }

    fn storage(&self) -> anyhow::Result<(u64, u64)> {
        let target = existing_ancestor(&self.storage_path);
        let disks = Disks::new_with_refreshed_list();

        let mounts = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()));
        disk_for(mounts, &target).with_context(|| format!("no mounted disk holds {}", target.display()))
    }
}

/// `(total, available)` of the mount with the longest prefix of `target`.
fn disk_for<'a>(mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>, target: &Path) -> Option<(u64, u64)> {
    mounts
        .into_iter()
        .filter(|(mount, _, _)| target.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, total, available)| (total, available))
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or(absolute)
}

impl ResourceProbe for SystemProbe {
    fn capture(&self) -> anyhow::Result<ResourceSnapshot> {
        let (total_memory, available_memory) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (system.total_memory(), system.available_memory())
        };
        if total_memory == 0 {
            anyhow::bail!("could not read system memory");
        }

        let cpu_core_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let approximate_cpu_load = (System::load_average().one / cpu_core_count as f64) as f32;
        let (total_storage, available_storage) = self.storage()?;

        Ok(ResourceSnapshot {
            total_memory,
            available_memory,
            total_storage,
            available_storage,
            cpu_core_count,
            approximate_cpu_load,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reads_memory() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemProbe::new(dir.path().join("not").join("yet"));
        let snap = probe.capture().unwrap();
        assert!(snap.total_memory > 0);
        assert!(snap.available_memory <= snap.total_memory);
        assert!(snap.cpu_core_count >= 1);
    }

    #[test]
    fn test_disk_for_picks_longest_mount() {
        let mounts = [
            (Path::new("/"), 100, 50),
            (Path::new("/data"), 10, 5),
        ];
        assert_eq!(disk_for(mounts, Path::new("/data/models/chat")), Some((10, 5)));
        assert_eq!(disk_for(mounts, Path::new("/home/me")), Some((100, 50)));
        assert_eq!(disk_for([(Path::new("/data"), 10, 5)], Path::new("/home/me")), None);
    }

    #[test]
    fn test_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a").join("b");
        assert_eq!(existing_ancestor(&missing), dir.path());
    }
}
