use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};

use fleetd::config::{resolve_root, Cli, Commands, DaemonPaths, RpcCommand};
use fleetd::protocol::Request;
use fleetd::{daemon, logging, socket};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => daemon::run(config).await,
        Commands::Rpc(cmd) => run_rpc(cmd).await,
    }
}

async fn run_rpc(cmd: RpcCommand) -> Result<()> {
    logging::init_stderr_logging("warn");

    let args: Map<String, Value> =
        serde_json::from_str(&cmd.args).context("--args must be a JSON object")?;
    let paths = DaemonPaths::from_root(&resolve_root(cmd.root.as_deref()));
    let request = Request {
        command: cmd.command,
        args,
    };

    let response = socket::send_request(&paths.socket_file, &request)
        .await
        .with_context(|| {
            format!(
                "failed to reach daemon at {} (is it running?)",
                paths.socket_file.display()
            )
        })?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}
