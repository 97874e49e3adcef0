// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `hsxd`: the HSX executive behind a JSON-lines TCP control plane.

use std::net::TcpListener;

use anyhow::Context as _;
use clap::Parser;
use hsx_exec::ExecConfig;
use hsxd::server;
use log::info;

#[derive(Debug, Parser)]
#[clap(about = "HSX executive RPC server")]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:9955", env = "HSXD_LISTEN")]
    listen: String,

    /// Guest RAM size in bytes.
    #[clap(long, default_value_t = 1024 * 1024)]
    ram_size: u32,

    /// Default per-task stack size in bytes.
    #[clap(long, default_value_t = 4096)]
    default_stack: u32,

    /// Per-subscription event queue depth.
    #[clap(long, default_value_t = 256)]
    event_queue_depth: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = ExecConfig {
        ram_size: args.ram_size,
        default_stack: args.default_stack,
        sub_queue_depth: args.event_queue_depth,
        ..ExecConfig::default()
    };

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("binding {}", args.listen))?;
    info!("hsxd listening on {}", listener.local_addr()?);
    server::serve(listener, cfg)
}
