mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;
use ipcwire_peer::ConnectionConfig;

use crate::cmd::Command;
use crate::exit::{io_error, peer_error, CliResult};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipcwire", version, about = "Acknowledged messaging over Unix sockets")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Connection configuration file (JSON).
    #[arg(long, value_name = "FILE", env = "IPCWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = load_config(cli.config.as_ref()).and_then(|config| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| io_error("runtime start failed", err))?;
        runtime.block_on(cmd::run(cli.command, config, format))
    });

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> CliResult<ConnectionConfig> {
    match path {
        Some(path) => ConnectionConfig::from_json_file(path)
            .map_err(|err| peer_error("config load failed", err)),
        None => Ok(ConnectionConfig::default()),
    }
}
