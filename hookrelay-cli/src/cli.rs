use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use hookrelay_core::{Flags, Overrides};

#[derive(Parser)]
#[command(name = "hookrelay", version)]
#[command(about = "Prepare a host to run the self-hosted webhook relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub target: TargetArgs,

    /// JSON config file layered under the command-line flags
    #[arg(long, global = true, env = "HOOKRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the full report as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Show debug output
    #[arg(long, short, global = true, env = "HOOKRELAY_VERBOSE")]
    pub verbose: bool,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Report what is installed and what `install` would change (default)
    Status,
    /// Bring the host to the desired state
    Install,
}

#[derive(Args)]
pub struct TargetArgs {
    /// Hostname the webhook endpoint is served on
    #[arg(long, global = true, env = "HOOKRELAY_WEBHOOK_HOST")]
    pub webhook_host: Option<String>,

    /// Public hostname routed through the tunnel
    #[arg(long, global = true, env = "HOOKRELAY_TUNNEL_HOST")]
    pub tunnel_host: Option<String>,

    /// Port the application listens on
    #[arg(long, short, global = true, env = "HOOKRELAY_PORT")]
    pub port: Option<u16>,

    /// Directory holding the compose project and its environment file
    #[arg(long, short = 'd', global = true, env = "HOOKRELAY_DIR")]
    pub dir: Option<PathBuf>,

    /// Generate a locally trusted certificate and serve HTTPS
    #[arg(long, global = true, env = "HOOKRELAY_LOCAL_CERT")]
    pub local_cert: bool,

    /// Install the tunnel client and write its ingress config
    #[arg(long, global = true, env = "HOOKRELAY_TUNNEL")]
    pub tunnel: bool,

    /// Allow installing nginx when it is missing
    #[arg(long, global = true)]
    pub install_proxy: bool,

    /// Allow installing Docker when it is missing
    #[arg(long, global = true)]
    pub install_container_engine: bool,

    /// Do not ask for confirmation
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    /// Show what would change without changing anything
    #[arg(long, short = 'n', global = true)]
    pub dry_run: bool,
}

impl Cli {
    pub fn action(&self) -> Commands {
        self.command.unwrap_or(Commands::Status)
    }

    pub fn overrides(&self) -> Overrides {
        let t = &self.target;
        Overrides {
            webhook_host: t.webhook_host.clone(),
            tunnel_host: t.tunnel_host.clone(),
            port: t.port,
            install_dir: t.dir.clone(),
            flags: Flags {
                generate_local_cert: t.local_cert,
                prepare_tunnel: t.tunnel,
                allow_install_proxy: t.install_proxy,
                allow_install_container_engine: t.install_container_engine,
                assume_yes: t.yes,
                dry_run: t.dry_run,
                verbose: self.verbose,
            },
        }
    }
}
