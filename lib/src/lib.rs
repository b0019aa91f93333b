//! Gantry implementation details.

// When building the project in release mode:
//   (1): Promote warnings into errors.
//   (2): Deny broken documentation links.
//   (3): Deny invalid codeblock attributes in documentation.
#![cfg_attr(not(debug_assertions), deny(warnings))]
#![cfg_attr(not(debug_assertions), deny(clippy::all))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(not(debug_assertions), deny(invalid_codeblock_attributes))]

pub mod config;
pub mod engine;
pub mod error;
pub mod service;

mod disk;
mod external;
mod headers;
mod listener;
mod network;
mod rewriter;
mod server;
mod tasks;
mod tls;
mod upstream;
mod util;
mod worker;

pub use {
    error::Error,
    headers::{HeaderId, HeaderInjector, HeaderTable, HeaderTableBuilder},
    rewriter::HttpRewriter,
    server::{ConfigErrorReporter, Overrides, Server, SocketOverride},
    tasks::TaskSet,
    util::{decode_pem, escape_json_string, http_time, PemData},
    worker::{WorkerEntrypointService, WorkerService},
};
