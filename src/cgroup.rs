//! Cgroup v1 controller: memory, cpu and pids hierarchies under
//! `/sys/fs/cgroup/{memory,cpu,pids}/fdocker/<id>/`.
//!
//! Ground truth is `cgroups/accessor.go` in the original source — `rocker`'s
//! dbus/systemd-transient-unit approach never writes these files at all, so
//! it is not carried forward (see DESIGN.md).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;

use crate::ids::ContainerId;

const CONTROLLERS: [&str; 3] = ["memory", "cpu", "pids"];
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

fn controller_dir(controller: &str, id: &ContainerId) -> PathBuf {
    PathBuf::from(CGROUP_ROOT)
        .join(controller)
        .join("fdocker")
        .join(id.as_str())
}

/// Resource limits requested for one container. `None`/`<=0` disables a
/// given limit, matching the CLI flag semantics in spec.md §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub mem_mb: Option<i64>,
    pub swap_mb: Option<i64>,
    pub pids: Option<i32>,
    pub cpus: Option<f64>,
}

/// Creates the three cgroup directories (if `create` is true) and joins the
/// *current* process to all three by writing its PID to `cgroup.procs`.
/// Must be called from the process that will exec the payload, so that
/// process and its descendants are the ones accounted.
pub fn create_cgroups(id: &ContainerId, create: bool) -> Result<()> {
    for controller in CONTROLLERS {
        let dir = controller_dir(controller, id);
        if create {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create cgroup directory: {}", dir.display()))?;
        }
        fs::write(dir.join("notify_on_release"), b"1")
            .with_context(|| format!("failed to arm notify_on_release for {}", dir.display()))?;
        fs::write(dir.join("cgroup.procs"), std::process::id().to_string())
            .with_context(|| format!("failed to join cgroup.procs for {}", dir.display()))?;
    }
    Ok(())
}

pub fn configure(id: &ContainerId, limits: Limits) -> Result<()> {
    if let Some(mem) = limits.mem_mb.filter(|m| *m > 0) {
        configure_memory(id, mem, limits.swap_mb)?;
    }
    if let Some(cpus) = limits.cpus.filter(|c| *c > 0.0) {
        configure_cpu(id, cpus)?;
    }
    if let Some(pids) = limits.pids.filter(|p| *p > 0) {
        configure_pids(id, pids)?;
    }
    Ok(())
}

fn configure_memory(id: &ContainerId, mem_mb: i64, swap_mb: Option<i64>) -> Result<()> {
    let dir = controller_dir("memory", id);
    let mem_bytes = mem_mb * 1024 * 1024;
    fs::write(dir.join("memory.limit_in_bytes"), mem_bytes.to_string())
        .context("failed to write memory.limit_in_bytes")?;

    // memory.memsw.limit_in_bytes is RAM+swap combined: if we only write
    // memory.limit_in_bytes, the container can still use unlimited swap.
    if let Some(swap_mb) = swap_mb.filter(|s| *s >= 0) {
        let memsw_bytes = mem_bytes + swap_mb * 1024 * 1024;
        fs::write(dir.join("memory.memsw.limit_in_bytes"), memsw_bytes.to_string())
            .context("failed to write memory.memsw.limit_in_bytes")?;
    }
    Ok(())
}

/// Returns `(period_us, quota_us)`, or `None` if the request exceeds the
/// host's CPU count and should be skipped with a warning.
pub fn cpu_quota_for(cpus: f64, host_cpus: usize) -> Option<(u64, u64)> {
    if cpus > host_cpus as f64 {
        return None;
    }
    const PERIOD_US: u64 = 1_000_000;
    let quota = (PERIOD_US as f64 * cpus).round() as u64;
    Some((PERIOD_US, quota))
}

fn configure_cpu(id: &ContainerId, cpus: f64) -> Result<()> {
    let host_cpus = num_cpus::get();
    let (period, quota) = match cpu_quota_for(cpus, host_cpus) {
        Some(v) => v,
        None => {
            warn!(
                "ignoring attempt to set CPU quota ({}) greater than available CPUs ({})",
                cpus, host_cpus
            );
            return Ok(());
        }
    };
    let dir = controller_dir("cpu", id);
    fs::write(dir.join("cpu.cfs_period_us"), period.to_string())
        .context("failed to write cpu.cfs_period_us")?;
    fs::write(dir.join("cpu.cfs_quota_us"), quota.to_string())
        .context("failed to write cpu.cfs_quota_us")?;
    Ok(())
}

fn configure_pids(id: &ContainerId, pids: i32) -> Result<()> {
    let dir = controller_dir("pids", id);
    fs::write(dir.join("pids.max"), pids.to_string()).context("failed to write pids.max")?;
    Ok(())
}

/// Removes all three cgroup directories. Safe once every process that was
/// in them has exited, which the caller guarantees by waiting for the
/// payload process first.
pub fn remove_cgroups(id: &ContainerId) -> Result<()> {
    let mut last_err = None;
    for controller in CONTROLLERS {
        let dir = controller_dir(controller, id);
        if let Err(e) = fs::remove_dir(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove cgroup dir {}: {}", dir.display(), e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(anyhow::anyhow!(
            "failed to remove one or more cgroup directories: {}",
            e
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_clamps_above_host_count() {
        assert!(cpu_quota_for(8.0, 4).is_none());
    }

    #[test]
    fn cpu_quota_computes_period_and_quota() {
        let (period, quota) = cpu_quota_for(1.5, 4).unwrap();
        assert_eq!(period, 1_000_000);
        assert_eq!(quota, 1_500_000);
    }

    #[test]
    fn cpu_quota_at_host_limit_is_allowed() {
        assert!(cpu_quota_for(4.0, 4).is_some());
    }
}
