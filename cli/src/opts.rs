//! Command-line arguments for the gantry daemon.

use anyhow::anyhow;
use clap::Parser;
use gantry_lib::{Overrides, SocketOverride};
use std::path::PathBuf;

/// Gantry, a configurable multi-service edge host.
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
pub struct Opts {
    /// Path to the configuration file.
    pub config: PathBuf,

    /// Listen on ADDR for the socket named NAME.
    #[arg(long = "socket-addr", value_name = "NAME=ADDR")]
    pub socket_addrs: Vec<String>,

    /// Connect to ADDR for the external service named NAME.
    #[arg(long = "external-addr", value_name = "NAME=ADDR")]
    pub external_addrs: Vec<String>,

    /// Serve PATH for the disk service named NAME.
    #[arg(long = "directory-path", value_name = "NAME=PATH")]
    pub directory_paths: Vec<String>,

    /// Verbosity of logging output (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Opts {
    /// Converts the repeated `NAME=VALUE` flags into override maps.
    pub fn overrides(&self) -> anyhow::Result<Overrides> {
        let mut overrides = Overrides::default();
        for (name, addr) in split_pairs(&self.socket_addrs, "--socket-addr")? {
            overrides
                .sockets
                .insert(name, SocketOverride::Address(addr));
        }
        for (name, addr) in split_pairs(&self.external_addrs, "--external-addr")? {
            overrides.external_addresses.insert(name, addr);
        }
        for (name, path) in split_pairs(&self.directory_paths, "--directory-path")? {
            overrides
                .directory_paths
                .insert(name, PathBuf::from(path));
        }
        Ok(overrides)
    }
}

fn split_pairs(entries: &[String], flag: &str) -> anyhow::Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .ok_or_else(|| anyhow!("{flag} expects NAME=VALUE, got '{entry}'"))
        })
        .collect()
}
