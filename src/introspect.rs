//! `ps`: enumerates running containers by walking the `cpu` cgroup
//! hierarchy rather than keeping a separate process table, exactly as
//! `original_source/cmds/impls/ps/ps.go` does.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::image;
use crate::paths::Paths;

const CPU_CGROUP_ROOT: &str = "/sys/fs/cgroup/cpu/fdocker";

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub image: String,
    pub command: String,
    pub pid: i32,
}

/// Non-existent cgroup root means no containers are running, not an error.
pub fn running_containers(paths: &Paths) -> Result<Vec<RunningContainer>> {
    let mut containers = Vec::new();
    let entries = match fs::read_dir(CPU_CGROUP_ROOT) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(containers),
        Err(e) => return Err(e).context("failed to read cpu cgroup root"),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if let Some(container) = container_info(paths, &id)? {
            containers.push(container);
        }
    }
    Ok(containers)
}

fn container_info(paths: &Paths, id: &str) -> Result<Option<RunningContainer>> {
    let procs_path = Path::new(CPU_CGROUP_ROOT).join(id).join("cgroup.procs");
    let procs = match fs::read_to_string(&procs_path) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    let pid: i32 = match procs.lines().filter(|l| !l.is_empty()).last() {
        Some(last) => last.trim().parse().context("malformed cgroup.procs entry")?,
        None => return Ok(None),
    };

    let exe_link = format!("/proc/{}/exe", pid);
    let exe = fs::read_link(&exe_link).with_context(|| format!("failed to readlink {}", exe_link))?;

    let container_mnt = paths.container_mnt(&crate::ids::ContainerId::parse(id)?);
    let real_mnt = fs::canonicalize(&container_mnt)
        .with_context(|| format!("failed to resolve container mount path: {}", container_mnt.display()))?;

    let command = exe
        .to_string_lossy()
        .strip_prefix(&*real_mnt.to_string_lossy())
        .unwrap_or(&exe.to_string_lossy())
        .to_string();

    let image = image_for_container(paths, id).unwrap_or_default();

    Ok(Some(RunningContainer {
        id: id.to_string(),
        image,
        command,
        pid,
    }))
}

/// Scans `/proc/mounts` for the overlay entry mentioning `id`, extracts the
/// first `lowerdir=` layer, and maps its 12-char prefix back to `name:tag`
/// via the image DB.
fn image_for_container(paths: &Paths, id: &str) -> Result<String> {
    let mounts = fs::read_to_string("/proc/mounts").context("failed to read /proc/mounts")?;
    let images_path = paths.images().display().to_string();
    let needle = format!("lowerdir={}/", images_path);

    for line in mounts.lines() {
        if !line.contains(id) {
            continue;
        }
        for part in line.split(' ') {
            for option in part.split(',') {
                if let Some(rest) = option.strip_prefix(&needle as &str) {
                    let image_id = &rest[..12.min(rest.len())];
                    let (name, tag) = image::get_image_and_tag_by_hash(paths, image_id)?;
                    if !name.is_empty() {
                        return Ok(format!("{}:{}", name, tag));
                    }
                }
            }
        }
    }
    Ok(String::new())
}

pub fn print_running_containers(paths: &Paths) -> Result<()> {
    println!("CONTAINER ID\tIMAGE\t\tCOMMAND");
    for container in running_containers(paths)? {
        println!("{}\t{}\t{}", container.id, container.image, container.command);
    }
    Ok(())
}
