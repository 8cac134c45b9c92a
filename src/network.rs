//! Host bridge, veth pairs, and the persistent network namespace bind mount.
//!
//! Netlink operations reuse the exact `rtnetlink`/`futures`/`tokio` shape
//! `rocker::network` already built; the namespace plumbing (`unshare` +
//! bind-mount-by-path, `setns` by `/proc/<pid>/ns/net`) is ported from
//! `network/accessor.go` in the original source, which is the variant that
//! keeps the bridge and default-gateway address consistent at
//! `172.31.0.1` (spec.md §9's mandated fix over the `network.go` variant's
//! `172.29.0.1` gateway bug).

use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::warn;
use nix::fcntl::{self, OFlag};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::Mode;
use rand::Rng;
use rtnetlink::{new_connection, Handle};

use crate::ids::ContainerId;
use crate::paths::{Paths, BRIDGE_ADDRESS, BRIDGE_NAME, NETWORK_CIDR};

fn host_veth_name(id: &ContainerId) -> String {
    format!("veth0_{}", id.short())
}

fn peer_veth_name(id: &ContainerId) -> String {
    format!("veth1_{}", id.short())
}

fn connection() -> Result<Handle> {
    let (connection, handle, _) = new_connection().context("failed to open netlink socket")?;
    tokio::spawn(connection);
    Ok(handle)
}

/// True iff a link named `fdocker0` exists, regardless of its admin state.
/// `setup_bridge` will fail with `EEXIST` if called against a bridge that's
/// merely down, so this must not also gate on `IFF_UP`.
pub async fn is_bridge_up() -> Result<bool> {
    let handle = connection()?;
    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        for nla in msg.nlas.iter() {
            if let rtnetlink::packet::rtnl::link::nlas::Nla::IfName(name) = nla {
                if name == BRIDGE_NAME {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

pub async fn setup_bridge() -> Result<()> {
    let handle = connection()?;
    handle
        .link()
        .add()
        .bridge(BRIDGE_NAME.to_string())
        .execute()
        .await
        .context("failed to add fdocker0 bridge")?;

    let bridge = find_link(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| anyhow!("bridge {} vanished right after creation", BRIDGE_NAME))?;

    let network: IpNetwork = NETWORK_CIDR.parse()?;
    let bridge_ip: IpAddr = BRIDGE_ADDRESS.parse()?;
    handle
        .address()
        .add(bridge.header.index, bridge_ip, network.prefix())
        .execute()
        .await
        .context("failed to address fdocker0 bridge")?;
    set_link_up(&handle, bridge.header.index).await?;
    Ok(())
}

pub async fn setup_virtual_eth_on_host(id: &ContainerId) -> Result<()> {
    let host_name = host_veth_name(id);
    let peer_name = peer_veth_name(id);
    let handle = connection()?;

    handle
        .link()
        .add()
        .veth(host_name.clone(), peer_name.clone())
        .execute()
        .await
        .context("failed to add veth pair")?;

    if let Some(peer_link) = find_link(&handle, &peer_name).await? {
        let mac = create_mac_address();
        if let Err(e) = handle
            .link()
            .set(peer_link.header.index)
            .address(mac.to_vec())
            .execute()
            .await
        {
            warn!("failed to set locally-administered MAC on {}: {}", peer_name, e);
        }
    }

    let host_link = find_link(&handle, &host_name)
        .await?
        .ok_or_else(|| anyhow!("link not found: {}", host_name))?;
    set_link_up(&handle, host_link.header.index).await?;

    let bridge = find_link(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| anyhow!("link not found: {}", BRIDGE_NAME))?;
    handle
        .link()
        .set(host_link.header.index)
        .master(bridge.header.index)
        .execute()
        .await
        .context("failed to attach veth to fdocker0")?;
    Ok(())
}

/// Creates the persistent netns file, unshares into a fresh network
/// namespace, and bind-mounts `/proc/self/ns/net` onto it so the namespace
/// survives after this short-lived process exits. The caller is expected to
/// be a re-exec of the binary (`setup-netns <id>`) that does nothing else.
pub fn setup_new_network_namespace(paths: &Paths, id: &ContainerId) -> Result<()> {
    std::fs::create_dir_all(paths.net_ns()).context("failed to create net-ns directory")?;
    let ns_path = paths.net_ns_file(id);

    let create_flags = OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_EXCL;
    let fd = fcntl::open(&ns_path, create_flags, Mode::from_bits_truncate(0o644))
        .with_context(|| format!("failed to create netns bind target: {}", ns_path.display()))?;
    nix::unistd::close(fd).ok();

    unshare(CloneFlags::CLONE_NEWNET).context("unshare(CLONE_NEWNET) failed")?;

    nix::mount::mount::<str, _, str, str>(
        Some("/proc/self/ns/net"),
        &ns_path,
        None,
        nix::mount::MsFlags::MS_BIND,
        None,
    )
    .context("failed to bind-mount /proc/self/ns/net onto the persistent netns file")?;

    Ok(())
}

/// Moves the peer veth into the container's netns (located via
/// `/proc/<pid>/ns/net`, since the owning process is still alive at this
/// point), then joins that namespace itself to address the link and add
/// the default route.
pub async fn setup_container_network_interface(id: &ContainerId, pid: i32) -> Result<()> {
    let peer_name = peer_veth_name(id);
    let ns_path = format!("/proc/{}/ns/net", pid);

    {
        let handle = connection()?;
        let link = find_link(&handle, &peer_name)
            .await?
            .ok_or_else(|| anyhow!("link not found: {}", peer_name))?;
        let fd = open_ns_fd(&ns_path)?;
        handle
            .link()
            .set(link.header.index)
            .setns_by_fd(fd)
            .execute()
            .await
            .context("failed to move veth peer into container netns")?;
        nix::unistd::close(fd).ok();
    }

    let fd = open_ns_fd(&ns_path)?;
    setns(fd, CloneFlags::CLONE_NEWNET).context("setns(CLONE_NEWNET) into container namespace failed")?;
    nix::unistd::close(fd).ok();

    let handle = connection()?;
    let link = find_link(&handle, &peer_name)
        .await?
        .ok_or_else(|| anyhow!("link not found after entering netns: {}", peer_name))?;

    let ip = random_container_ip();
    let addr: IpNetwork = format!("{}/16", ip).parse()?;
    handle
        .address()
        .add(link.header.index, addr.ip(), addr.prefix())
        .execute()
        .await
        .context("failed to address container veth")?;
    set_link_up(&handle, link.header.index).await?;

    let gateway: Ipv4Addr = BRIDGE_ADDRESS.parse()?;
    handle
        .route()
        .add()
        .v4()
        .destination_prefix("0.0.0.0".parse()?, 0)
        .gateway(gateway)
        .execute()
        .await
        .context("failed to add default route")?;

    Ok(())
}

/// Brings up `lo` with `127.0.0.1/32` in the *current* network namespace.
pub async fn setup_local_interface() -> Result<()> {
    let handle = connection()?;
    let link = find_link(&handle, "lo")
        .await?
        .ok_or_else(|| anyhow!("link not found: lo"))?;
    let addr: IpNetwork = "127.0.0.1/32".parse()?;
    handle
        .address()
        .add(link.header.index, addr.ip(), addr.prefix())
        .execute()
        .await
        .context("failed to address loopback interface")?;
    set_link_up(&handle, link.header.index).await?;
    Ok(())
}

pub fn join_container_network_namespace(paths: &Paths, id: &ContainerId) -> Result<()> {
    let ns_path = paths.net_ns_file(id);
    let fd = open_ns_fd_path(&ns_path)?;
    setns(fd, CloneFlags::CLONE_NEWNET).context("setns(CLONE_NEWNET) failed")?;
    nix::unistd::close(fd).ok();
    Ok(())
}

pub fn unmount_network_namespace(paths: &Paths, id: &ContainerId) -> Result<()> {
    let ns_path = paths.net_ns_file(id);
    nix::mount::umount(&ns_path)
        .with_context(|| format!("failed to unmount netns bind file: {}", ns_path.display()))?;
    std::fs::remove_file(&ns_path).ok();
    Ok(())
}

async fn find_link(
    handle: &Handle,
    name: &str,
) -> Result<Option<rtnetlink::packet::LinkMessage>> {
    let mut links = handle.link().get().set_name_filter(name.to_string()).execute();
    Ok(links.try_next().await?)
}

async fn set_link_up(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .context("failed to bring link up")
}

fn open_ns_fd(proc_ns_path: &str) -> Result<RawFd> {
    fcntl::open(proc_ns_path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("failed to open namespace handle: {}", proc_ns_path))
}

fn open_ns_fd_path(path: &std::path::Path) -> Result<RawFd> {
    fcntl::open(path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("failed to open namespace handle: {}", path.display()))
}

fn create_mac_address() -> [u8; 6] {
    let mut hw = [0u8; 6];
    hw[0] = 0x02;
    hw[1] = 0x42;
    rand::thread_rng().fill(&mut hw[2..]);
    hw
}

/// Picks a random `172.31.X.Y` address. No collision checking, as in the
/// original (spec.md §9 leaves this behavior as-is).
fn random_container_ip() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(172, 31, rng.gen_range(0..254), rng.gen_range(0..254))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_is_locally_administered() {
        let mac = create_mac_address();
        assert_eq!(mac[0], 0x02);
        assert_eq!(mac[1], 0x42);
    }

    #[test]
    fn container_ip_is_in_172_31_range() {
        let ip = random_container_ip();
        assert_eq!(ip.octets()[0], 172);
        assert_eq!(ip.octets()[1], 31);
    }

    #[test]
    fn veth_names_use_first_six_chars_of_id() {
        let id = ContainerId::parse("abcdef012345").unwrap();
        assert_eq!(host_veth_name(&id), "veth0_abcdef");
        assert_eq!(peer_veth_name(&id), "veth1_abcdef");
    }
}
