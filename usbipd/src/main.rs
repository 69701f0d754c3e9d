use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use usbip::{
    config::{self, ServerConfig},
    dispatch,
    local::{claim::HostDriverClaimRegistry, directory::UdevDeviceDirectory},
};

#[derive(Debug, clap::Parser)]
struct Args {
    /// Path to the server's TOML configuration file
    #[arg(short = 'c', long = "config", name = "FILE")]
    config: Option<PathBuf>,
    /// Run in device mode
    ///
    /// Rather than drive an attached device, create a virtual UDC to bind gadgets to
    #[arg(short = 'e', long)]
    device: bool,
    /// Print debugging information
    #[arg(short = 'd', long)]
    debug: bool,
    /// Write process id to FILE
    ///
    /// If no FILE specified, use `/var/run/usbipd.pid`
    #[arg(short = 'P', long = "pid", name = "FILE")]
    pid_file: Option<Option<PathBuf>>,
    /// Listen on TCP/IP port PORT, overriding the config file
    #[arg(short = 't', long = "tcp-port")]
    port: Option<u16>,
}

fn main() {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    if args.device {
        tracing::error!("device mode (virtual UDC / gadget binding) is not implemented");
        std::process::exit(1);
    }

    let mut config: ServerConfig = config::load_or_default(args.config.as_deref());

    if let Some(port) = args.port {
        config.port = port;
    }

    if let Some(pid_file) = args.pid_file {
        let path = pid_file.unwrap_or_else(|| PathBuf::from("/var/run/usbipd.pid"));
        if let Err(err) = std::fs::write(&path, std::process::id().to_string()) {
            tracing::warn!(path = %path.display(), %err, "failed to write pid file");
        }
    }

    let directory = Arc::new(UdevDeviceDirectory::new());
    let claims = Arc::new(HostDriverClaimRegistry::new());

    if let Err(err) = dispatch::serve(directory, claims, config) {
        tracing::error!(%err, "usbip server exited with an error");
        std::process::exit(1);
    }
}
