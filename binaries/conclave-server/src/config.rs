use std::{fs, net::SocketAddr, path::PathBuf, sync::LazyLock};

use clap::Parser;
use serde::Deserialize;

/// Port the relay listens on unless a config file overrides it.
pub const DEFAULT_PORT: u16 = 14194;

#[derive(Parser, Debug)]
#[command(name = "conclave-server")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    let args = Args::parse();
    let Some(path) = args.config else {
        return Config {
            listen: default_listen(),
        };
    };
    let raw = fs::read_to_string(&path).unwrap_or_else(|err| {
        panic!("failed to read config {}: {err}", path.display());
    });
    toml::from_str(&raw).unwrap_or_else(|err| {
        panic!("failed to parse config {}: {err}", path.display());
    })
});
