use {
    clap::Parser,
    log::{info, warn},
    p9core::{
        srv::{Config, Server},
        Dialect, DEFAULT_MSIZE,
    },
    tokio::signal::unix::{signal, SignalKind},
};

mod ramfs;
use crate::ramfs::RamFs;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Largest message size offered to clients
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    /// Also accept plain 9P2000 clients
    #[arg(long)]
    legacy: bool,

    /// Fids a single connection may hold
    #[arg(long, default_value_t = 65536)]
    max_fids: usize,

    /// Owner of the root directory
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// Group of the root directory
    #[arg(long, default_value_t = 0)]
    gid: u32,
}

impl Cli {
    fn config(&self) -> Config {
        let mut dialects = vec![Dialect::P92000L];
        if self.legacy {
            dialects.push(Dialect::P92000);
        }
        Config {
            msize: self.msize,
            dialects,
            max_fids: self.max_fids,
        }
    }
}

async fn ramfs_main(cli: Cli) -> p9core::Result<i32> {
    let server = Server::new(RamFs::new(cli.uid, cli.gid), cli.config())?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let stopper = server.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => warn!("interrupted"),
            _ = sigterm.recv() => warn!("terminated"),
        }
        stopper.shutdown();
    });

    info!("msize {}, dialects {:?}", cli.msize, server.config().dialects);
    println!("[*] Ready to accept clients: {}", cli.address);
    server.serve(&cli.address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ramfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["p9ramfs", "tcp!0.0.0.0!564"]);
        assert_eq!(cli.address, "tcp!0.0.0.0!564");
        assert_eq!(cli.config(), Config::default());
    }

    #[test]
    fn legacy_flag_adds_dialect() {
        let cli = Cli::parse_from([
            "p9ramfs",
            "unix!/tmp/ramfs!0",
            "--legacy",
            "--msize",
            "8192",
            "--max-fids",
            "16",
        ]);
        let config = cli.config();
        assert_eq!(config.msize, 8192);
        assert_eq!(config.max_fids, 16);
        assert_eq!(config.dialects, [Dialect::P92000L, Dialect::P92000]);
        assert!(config.validate().is_ok());
    }
}
