use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ids::ContainerId;

pub const BRIDGE_NAME: &str = "fdocker0";
pub const BRIDGE_ADDRESS: &str = "172.31.0.1";
pub const NETWORK_CIDR: &str = "172.31.0.0/16";

/// Canonical host paths, gathered in one place instead of re-derived as ad
/// hoc format strings at every call site (`workdirs` in the original Go
/// source, module-level consts in `rocker`).
#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
    tmp: PathBuf,
    images: PathBuf,
    containers: PathBuf,
    net_ns: PathBuf,
}

impl Paths {
    pub fn production() -> Self {
        let home = PathBuf::from("/var/lib/f-docker");
        Paths {
            tmp: home.join("tmp"),
            images: home.join("images"),
            home,
            containers: PathBuf::from("/var/run/f-docker/containers"),
            net_ns: PathBuf::from("/var/run/f-docker/net-ns"),
        }
    }

    #[cfg(test)]
    pub fn under(root: &Path) -> Self {
        Paths {
            home: root.join("lib"),
            tmp: root.join("lib/tmp"),
            images: root.join("lib/images"),
            containers: root.join("run/containers"),
            net_ns: root.join("run/net-ns"),
        }
    }

    pub fn ensure_roots(&self) -> Result<()> {
        for dir in [&self.home, &self.tmp, &self.images, &self.containers] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn tmp(&self) -> &Path {
        &self.tmp
    }

    pub fn images(&self) -> &Path {
        &self.images
    }

    pub fn containers(&self) -> &Path {
        &self.containers
    }

    pub fn net_ns(&self) -> &Path {
        &self.net_ns
    }

    pub fn images_db_file(&self) -> PathBuf {
        self.images.join("images.json")
    }

    pub fn image_dir(&self, image_id: &str) -> PathBuf {
        self.images.join(image_id)
    }

    pub fn container_fs_home(&self, id: &ContainerId) -> PathBuf {
        self.containers.join(id.as_str()).join("fs")
    }

    pub fn container_mnt(&self, id: &ContainerId) -> PathBuf {
        self.container_fs_home(id).join("mnt")
    }

    pub fn container_upperdir(&self, id: &ContainerId) -> PathBuf {
        self.container_fs_home(id).join("upperdir")
    }

    pub fn container_workdir(&self, id: &ContainerId) -> PathBuf {
        self.container_fs_home(id).join("workdir")
    }

    pub fn container_root(&self, id: &ContainerId) -> PathBuf {
        self.containers.join(id.as_str())
    }

    pub fn net_ns_file(&self, id: &ContainerId) -> PathBuf {
        self.net_ns.join(id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_paths_are_rooted_under_fs_home() {
        let p = Paths::under(Path::new("/scratch"));
        let id = ContainerId::parse("0123456789ab").unwrap();
        assert_eq!(
            p.container_mnt(&id),
            PathBuf::from("/scratch/run/containers/0123456789ab/fs/mnt")
        );
        assert_eq!(
            p.container_upperdir(&id),
            PathBuf::from("/scratch/run/containers/0123456789ab/fs/upperdir")
        );
    }

    #[test]
    fn ensure_roots_creates_all_but_net_ns() {
        let dir = tempfile::tempdir().unwrap();
        let p = Paths::under(dir.path());
        p.ensure_roots().unwrap();
        assert!(p.tmp().exists());
        assert!(p.images().exists());
        assert!(p.containers().exists());
        assert!(!p.net_ns().exists());
    }
}
