//! Container lifecycle engine: the `run` phase sequence plus the
//! `child-mode`/`setup-netns`/`setup-veth` re-exec targets it spawns.
//!
//! Ported phase-for-phase from `cmds/impls/run/run.go` and
//! `cmds/impls/childmode/child_mode.go` in the original source. `rocker`'s
//! `container.rs` does the equivalent of all eleven phases in a single
//! process via `nix::sched::clone` plus in-process `setns`/`chroot`; that
//! shortcut can't hand a namespace-owning PID to a separate `setup-veth`
//! step and never re-execs `/proc/self/exe`, so it isn't carried forward
//! (see DESIGN.md). What *is* kept from `rocker` is the `clone` + `execv`
//! pairing itself — `unshare(CLONE_NEWPID)` only affects the *next* forked
//! child, never the calling process, so entering a fresh PID namespace
//! still has to go through `clone`.

use std::ffi::CString;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execv, sethostname, Pid};

use crate::cgroup::{self, Limits};
use crate::error::FdockerError;
use crate::ids::{ContainerId, ImageId};
use crate::image;
use crate::network;
use crate::paths::Paths;

const CURRENT_EXE: &str = "/proc/self/exe";

pub struct RunRequest {
    pub limits: Limits,
    pub image_ref: String,
    pub command: Vec<String>,
}

/// Runs every phase of §4.F and returns the payload's exit code. Resource
/// teardown is handled by the guards `launch` installs as it acquires each
/// resource, so it runs whether `launch` returns normally or panics.
pub async fn run(paths: &Paths, req: RunRequest) -> Result<i32> {
    if !network::is_bridge_up().await? {
        log::info!("setting up the {} bridge on host", crate::paths::BRIDGE_NAME);
        network::setup_bridge().await.context("failed to set up host bridge")?;
    }

    let image_id = image::download_image_if_required(paths, &req.image_ref).await?;
    log::info!("image to overlay mount: {}", image_id);

    let id = ContainerId::generate();
    log::info!("new container ID: {}", id);

    launch(paths, &id, &image_id, &req).await
}

/// Guards a container's scratch directory tree (§4.F phase 4): removed on
/// drop, which covers both the ordinary post-`waitpid` exit and a panic
/// unwinding out of any later phase.
struct ScratchDirsGuard<'a> {
    paths: &'a Paths,
    id: ContainerId,
}

impl Drop for ScratchDirsGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(self.paths.container_root(&self.id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                let err = FdockerError::TeardownWarning(format!("failed to remove container directory: {}", e));
                log::warn!("{}", err);
            }
        }
    }
}

/// Guards the overlay mount (§4.F phase 5): unmounted on drop, before
/// `ScratchDirsGuard` runs (construction order below is reverse-drop order).
struct OverlayMountGuard<'a> {
    paths: &'a Paths,
    id: ContainerId,
}

impl Drop for OverlayMountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = umount(&self.paths.container_mnt(&self.id)) {
            let err = FdockerError::TeardownWarning(format!("failed to unmount container overlay: {}", e));
            log::warn!("{}", err);
        }
    }
}

/// Guards the persistent network namespace bind mount (§4.F phase 7).
struct NetnsGuard<'a> {
    paths: &'a Paths,
    id: ContainerId,
}

impl Drop for NetnsGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = network::unmount_network_namespace(self.paths, &self.id) {
            let err = FdockerError::TeardownWarning(format!("{:#}", e));
            log::warn!("{}", err);
        }
    }
}

/// Guards the cgroup v1 hierarchies the cloned `child-mode` process joins
/// (§4.F phase 9). Acquired right before `clone`, since that's the earliest
/// point a panic could leave them behind.
struct CgroupsGuard {
    id: ContainerId,
}

impl Drop for CgroupsGuard {
    fn drop(&mut self) {
        if let Err(e) = cgroup::remove_cgroups(&self.id) {
            let err = FdockerError::TeardownWarning(format!("{:#}", e));
            log::warn!("{}", err);
        }
    }
}

/// Runs every phase of §4.F and returns the payload's exit code. Each
/// acquired resource is wrapped in a guard the moment it exists, so a panic
/// anywhere in here still releases everything acquired so far — construction
/// order here is the reverse of the release order, matching the phase order
/// in §4.F.
async fn launch(paths: &Paths, id: &ContainerId, image_id: &ImageId, req: &RunRequest) -> Result<i32> {
    create_container_directories(paths, id)?;
    let _scratch_guard = ScratchDirsGuard { paths, id: id.clone() };

    mount_overlay(paths, id, image_id)?;
    let _overlay_guard = OverlayMountGuard { paths, id: id.clone() };

    network::setup_virtual_eth_on_host(id)
        .await
        .context("failed to set up host veth")?;

    let mut netns_helper = spawn_netns_helper(id)?;
    let netns_pid = wait_for_netns_ready(&mut netns_helper)?;
    let _netns_guard = NetnsGuard { paths, id: id.clone() };

    let veth_status = Command::new(CURRENT_EXE)
        .args(["setup-veth", id.as_str(), &netns_pid.to_string()])
        .status()
        .context("failed to run setup-veth helper")?;
    if !veth_status.success() {
        release_netns_helper(netns_helper).ok();
        return Err(anyhow!("setup-veth helper exited with {}", veth_status));
    }
    release_netns_helper(netns_helper)?;

    let argv = build_child_mode_argv(id, image_id, req.limits, &req.command);
    let _cgroups_guard = CgroupsGuard { id: id.clone() };
    let pid = spawn_child_mode(argv)?;
    let status = waitpid(pid, None).context("failed to wait for child-mode process")?;
    Ok(exit_code_from_status(status))
}

fn exit_code_from_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn create_container_directories(paths: &Paths, id: &ContainerId) -> Result<()> {
    for dir in [
        paths.container_fs_home(id),
        paths.container_mnt(id),
        paths.container_upperdir(id),
        paths.container_workdir(id),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}

fn mount_overlay(paths: &Paths, id: &ContainerId, image_id: &ImageId) -> Result<()> {
    let manifest = image::parse_manifest(&image::manifest_path_for_image(paths, image_id))?;
    let lowerdir = image::build_lowerdir(paths, image_id, &manifest);
    let upper = paths.container_upperdir(id);
    let work = paths.container_workdir(id);
    let mnt = paths.container_mnt(id);
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    );
    mount::<str, Path, str, str>(Some("none"), &mnt, Some("overlay"), MsFlags::empty(), Some(options.as_str()))
        .context("failed to mount overlay filesystem")
}

/// Spawns `setup-netns <id>` with piped stdio so the parent can learn its
/// PID and block until the namespace bind mount is in place before moving
/// on to `setup-veth`, which needs that PID to reach `/proc/<pid>/ns/net`.
fn spawn_netns_helper(id: &ContainerId) -> Result<Child> {
    Command::new(CURRENT_EXE)
        .args(["setup-netns", id.as_str()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to spawn setup-netns helper")
}

fn wait_for_netns_ready(child: &mut Child) -> Result<i32> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("setup-netns helper has no stdout"))?;
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .context("failed to read readiness signal from setup-netns helper")?;
    if line.trim() != "ready" {
        return Err(anyhow!("unexpected readiness signal from setup-netns helper: {:?}", line));
    }
    Ok(child.id() as i32)
}

fn release_netns_helper(mut child: Child) -> Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"go\n");
    }
    let status = child.wait().context("failed to wait for setup-netns helper")?;
    if !status.success() {
        return Err(anyhow!("setup-netns helper exited with {}", status));
    }
    Ok(())
}

fn build_child_mode_argv(id: &ContainerId, image_id: &ImageId, limits: Limits, command: &[String]) -> Vec<CString> {
    let mut args = vec![
        CString::new(CURRENT_EXE).unwrap(),
        CString::new("child-mode").unwrap(),
    ];
    if let Some(mem) = limits.mem_mb.filter(|m| *m > 0) {
        args.push(CString::new(format!("--mem={}", mem)).unwrap());
    }
    if let Some(swap) = limits.swap_mb.filter(|s| *s >= 0) {
        args.push(CString::new(format!("--swap={}", swap)).unwrap());
    }
    if let Some(pids) = limits.pids.filter(|p| *p > 0) {
        args.push(CString::new(format!("--pids={}", pids)).unwrap());
    }
    if let Some(cpus) = limits.cpus.filter(|c| *c > 0.0) {
        args.push(CString::new(format!("--cpus={:.1}", cpus)).unwrap());
    }
    args.push(CString::new(format!("--img={}", image_id)).unwrap());
    args.push(CString::new(id.as_str()).unwrap());
    for c in command {
        args.push(CString::new(c.as_str()).unwrap());
    }
    args
}

/// `unshare(CLONE_NEWPID)` would only isolate processes the *current*
/// process later forks, not itself, so entering fresh PID/mount/UTS/IPC
/// namespaces means `clone`-ing a new process and `execv`-ing
/// `/proc/self/exe child-mode …` from inside it.
fn spawn_child_mode(argv: Vec<CString>) -> Result<Pid> {
    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];
    let exe = argv[0].clone();

    let cb = Box::new(move || -> isize {
        match execv(&exe, &argv) {
            Ok(_) => unreachable!("execv only returns on error"),
            Err(e) => {
                eprintln!("failed to exec child-mode: {}", e);
                127
            }
        }
    });

    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32)).context("failed to clone child-mode process")
}

/// Carries the flags parsed out of `child-mode`'s CLI back into
/// `run_child_mode`. Mirrors `child_mode.go`'s `execContainerCommand` step
/// for step.
pub struct ChildModeRequest {
    pub id: ContainerId,
    pub image_id: ImageId,
    pub limits: Limits,
    pub command: Vec<String>,
}

pub fn run_child_mode(paths: &Paths, req: ChildModeRequest) -> Result<i32> {
    sethostname(req.id.as_str()).context("failed to set hostname")?;
    network::join_container_network_namespace(paths, &req.id)
        .context("failed to join container network namespace")?;

    cgroup::create_cgroups(&req.id, true).context("failed to create cgroups")?;
    cgroup::configure(&req.id, req.limits).context("failed to configure cgroups")?;

    let config = image::parse_container_config(paths, &req.image_id)?;

    let mnt = paths.container_mnt(&req.id);
    copy_nameserver_config(&mnt).context("failed to copy resolv.conf into container")?;

    chroot(&mnt).context("failed to chroot")?;
    chdir("/").context("failed to chdir after chroot")?;

    mount_container_fs()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(network::setup_local_interface())?;

    let mut cmd = Command::new(&req.command[0]);
    cmd.args(&req.command[1..]);
    cmd.env_clear();
    for entry in &config.config.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    let status = cmd.status();

    unmount_container_fs();

    match status {
        Ok(s) => Ok(s.code().unwrap_or(1)),
        Err(e) => Err(FdockerError::ChildPayload(format!("failed to execute command: {}", e)).into()),
    }
}

fn copy_nameserver_config(mnt: &Path) -> Result<()> {
    const CANDIDATES: [&str; 3] = [
        "/var/run/systemd/resolve/resolv.conf",
        "/etc/fdockerresolv.conf",
        "/etc/resolv.conf",
    ];
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            let dest = mnt.join("etc/resolv.conf");
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            return fs::copy(candidate, &dest)
                .map(|_| ())
                .with_context(|| format!("failed to copy {} into container", candidate));
        }
    }
    Ok(())
}

fn mount_container_fs() -> Result<()> {
    fs::create_dir_all("/proc").context("failed to create /proc")?;
    mount_fs(Some("proc"), "/proc", Some("proc"))?;
    mount_fs(Some("tmpfs"), "/tmp", Some("tmpfs"))?;
    mount_fs(Some("tmpfs"), "/dev", Some("tmpfs"))?;
    fs::create_dir_all("/dev/pts").context("failed to create /dev/pts")?;
    mount_fs(Some("devpts"), "/dev/pts", Some("devpts"))?;
    fs::create_dir_all("/sys").context("failed to create /sys")?;
    mount_fs(Some("sysfs"), "/sys", Some("sysfs"))?;
    Ok(())
}

fn unmount_container_fs() {
    for target in ["/dev/pts", "/dev", "/sys", "/proc", "/tmp"] {
        if let Err(e) = umount(target) {
            log::warn!("failed to unmount {}: {}", target, e);
        }
    }
}

fn mount_fs(source: Option<&str>, target: &str, fstype: Option<&str>) -> Result<()> {
    mount::<str, str, str, str>(source, target, fstype, MsFlags::empty(), None)
        .with_context(|| format!("failed to mount {} at {}", fstype.unwrap_or("?"), target))
}

/// Re-exec target for `setup-netns <id>`: creates the persistent network
/// namespace, signals readiness on stdout, then blocks until the parent
/// releases it over stdin (it must stay alive for `setup-veth` to reach it
/// through `/proc/<pid>/ns/net`).
pub fn run_setup_netns(paths: &Paths, id: &ContainerId) -> Result<()> {
    network::setup_new_network_namespace(paths, id)?;
    println!("ready");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok();
    Ok(())
}

/// Re-exec target for `setup-veth <id> <pid>`.
pub async fn run_setup_veth(id: &ContainerId, pid: i32) -> Result<()> {
    network::setup_container_network_interface(id, pid).await
}

