// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `dispatcherd call <service.method> [ARGS...]`

use anyhow::Result;
use colored::Colorize;

use dispatcher_client::ClientError;

use super::{parse_args, render, ConnectArgs};

pub async fn handle_command(connect: &ConnectArgs, method: String, args: Vec<String>) -> Result<()> {
    let client = connect.connect().await?;
    let result = client.call(&method, parse_args(&args)).await;
    client.close().await;

    match result {
        Ok(value) => {
            println!("{}", render(&value));
            Ok(())
        }
        Err(ClientError::Rpc(e)) => {
            eprintln!("{} {}", format!("[{}]", e.kind.symbol()).red(), e.message);
            if let Some(extra) = &e.extra {
                eprintln!("{}", render(extra).dimmed());
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
