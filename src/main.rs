// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use dundi_rs::{
    Engine, StaticDialplan, Store,
    cfg::{
        cli::{resolve_config_path, split_number_context},
        config::Config,
        logger::init_logger,
    },
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "dundi.yaml".to_string());
    let lookup_arg = args.next();

    let _init_logger = init_logger("config_logger.yaml").ok();

    let cfg = resolve_config_path(&config_path)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    // The demo dialplan is a literal extension table from the config.
    let mut dialplan = StaticDialplan::new();
    for (context, extens) in &cfg.dialplan {
        for exten in extens {
            dialplan.add_extension(context, exten);
        }
    }

    let engine = Engine::spawn(cfg, Arc::new(dialplan), Store::memory()).await?;
    info!(eid = %engine.local_eid(), "engine started");

    match lookup_arg {
        Some(arg) => {
            let (number, context) = split_number_context(&arg);
            let results = engine.lookup(number, context, false).await?;
            if results.is_empty() {
                println!("lookup returned no results");
            }
            for (x, r) in results.iter().enumerate() {
                println!(
                    "{:3}. {:5} {}/{} ({})",
                    x + 1,
                    r.weight,
                    r.tech,
                    r.dest,
                    r.flags
                );
                println!("     from {}, expires in {} s", r.eid, r.expiration);
            }
            engine.stop().await;
        },
        None => {
            // Serve until interrupted.
            tokio::signal::ctrl_c().await?;
            engine.stop().await;
        },
    }

    Ok(())
}
