use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fdocker", about = "A minimal Linux container runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull an image if needed and run a command in a fresh container.
    Run {
        #[arg(long)]
        mem: Option<i64>,
        #[arg(long)]
        swap: Option<i64>,
        #[arg(long)]
        pids: Option<i32>,
        #[arg(long)]
        cpus: Option<f64>,
        image: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// List running containers.
    Ps,
    /// List locally available images.
    Images,
    /// Remove an image by ID.
    Rmi { image_id: String },

    /// Entered only via re-exec from `run`, inside the cloned namespaces.
    #[command(name = "child-mode", hide = true)]
    ChildMode {
        #[arg(long)]
        mem: Option<i64>,
        #[arg(long)]
        swap: Option<i64>,
        #[arg(long)]
        pids: Option<i32>,
        #[arg(long)]
        cpus: Option<f64>,
        #[arg(long)]
        img: String,
        id: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Entered only via re-exec from `run`, to create the persistent netns.
    #[command(name = "setup-netns", hide = true)]
    SetupNetns { id: String },

    /// Entered only via re-exec from `run`, to move the peer veth in.
    #[command(name = "setup-veth", hide = true)]
    SetupVeth { id: String, pid: i32 },
}
