//! The gantry daemon: a configurable multi-service edge host.

// When building the project in release mode:
//   (1): Promote warnings into errors.
//   (2): Deny broken documentation links.
//   (3): Deny invalid codeblock attributes in documentation.
#![cfg_attr(not(debug_assertions), deny(warnings))]
#![cfg_attr(not(debug_assertions), deny(clippy::all))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(not(debug_assertions), deny(invalid_codeblock_attributes))]

mod opts;

use crate::opts::Opts;
use clap::Parser;
use gantry_lib::{config::Config, engine::NoScriptEngine, Server};
use std::env;
use std::sync::Arc;
use tracing::{event, Level};
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    install_tracing_subscriber(opts.verbose);

    let config = Config::from_file(&opts.config)?;
    let overrides = opts.overrides()?;

    // Configuration problems disable the services they belong to; the rest
    // of the server keeps serving, so these only log.
    let mut server = Server::new(|message| {
        tracing::error!("config error: {message}");
    });

    server
        .run(Arc::new(NoScriptEngine), config, overrides)
        .await?;
    Ok(())
}

fn install_tracing_subscriber(verbosity: u8) {
    // Default to whatever the user provides, but if `RUST_LOG` is not set,
    // scale logging for gantry's own crates with the verbosity flag.
    if env::var("RUST_LOG").ok().is_none() {
        match verbosity {
            0 => env::set_var("RUST_LOG", "gantry=warn,gantry_lib=warn"),
            1 => env::set_var("RUST_LOG", "gantry=info,gantry_lib=info"),
            2 => env::set_var("RUST_LOG", "gantry=debug,gantry_lib=debug"),
            _ => env::set_var("RUST_LOG", "gantry=trace,gantry_lib=trace"),
        }
    }

    let builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);

    match env::var("RUST_LOG_PRETTY") {
        // When `RUST_LOG_PRETTY` is set to "true", emit logs in a pretty,
        // human-readable output format.
        Ok(s) if s == "true" => builder.pretty().with_level(true).init(),
        // Otherwise, install the subscriber without any further additions.
        _ => builder.with_ansi(false).init(),
    }
    event!(
        Level::DEBUG,
        "RUST_LOG set to '{}'",
        env::var("RUST_LOG").unwrap_or_else(|_| String::from("<unset>"))
    );
}
