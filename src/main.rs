use anyhow::Result;
use clap::Parser;

use cgroup::Limits;
use cli::{Cli, Commands};
use error::FdockerError;
use ids::{ContainerId, ImageId};
use paths::Paths;

mod cgroup;
mod cli;
mod container;
mod error;
mod ids;
mod image;
mod introspect;
mod network;
mod paths;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("FDOCKER_LOG", "info")).init();

    let cli = Cli::parse();

    if !nix::unistd::getuid().is_root() {
        return Err(FdockerError::setup("you need root privileges to run this program").into());
    }

    let paths = Paths::production();
    paths.ensure_roots()?;

    match cli.command {
        Commands::Run { mem, swap, pids, cpus, image, command } => {
            let limits = Limits { mem_mb: mem, swap_mb: swap, pids, cpus };
            let exit_code = tokio::runtime::Runtime::new()?.block_on(container::run(
                &paths,
                container::RunRequest { limits, image_ref: image, command },
            ))?;
            std::process::exit(exit_code);
        }
        Commands::Ps => introspect::print_running_containers(&paths)?,
        Commands::Images => image::print_available_images(&paths)?,
        Commands::Rmi { image_id } => rmi(&paths, &image_id)?,
        Commands::ChildMode { mem, swap, pids, cpus, img, id, command } => {
            let limits = Limits { mem_mb: mem, swap_mb: swap, pids, cpus };
            let id = ContainerId::parse(&id)?;
            let image_id = ImageId::parse(&img)?;
            let code = container::run_child_mode(
                &paths,
                container::ChildModeRequest { id, image_id, limits, command },
            )?;
            std::process::exit(code);
        }
        Commands::SetupNetns { id } => {
            let id = ContainerId::parse(&id)?;
            container::run_setup_netns(&paths, &id)?;
        }
        Commands::SetupVeth { id, pid } => {
            let id = ContainerId::parse(&id)?;
            tokio::runtime::Runtime::new()?.block_on(container::run_setup_veth(&id, pid))?;
        }
    };

    Ok(())
}

/// `rmi`: fatal if the image is unknown or still in use by a running
/// container, matching `cmds/impls/rmi/rmi.go`'s reuse of the `ps` listing.
fn rmi(paths: &Paths, image_id: &str) -> Result<()> {
    let (name, tag) = image::get_image_and_tag_by_hash(paths, image_id)?;
    if name.is_empty() {
        return Err(FdockerError::user("no such image").into());
    }
    let target = format!("{}:{}", name, tag);
    for container in introspect::running_containers(paths)? {
        if container.image == target {
            return Err(FdockerError::user(format!(
                "cannot delete image because it is in use by: {}",
                container.id
            ))
            .into());
        }
    }
    image::delete_image_by_hash(paths, image_id)
}
