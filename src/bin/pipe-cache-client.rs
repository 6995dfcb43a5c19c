//! One-shot client for the pipe-cache server.
//!
//! With command words, sends them as one command and prints the response.
//! Without, runs a short SET/GET demonstration.

use clap::Parser;
use pipe_cache::client::send_command;
use pipe_cache::config::DEFAULT_PIPE_NAME;
use pipe_cache::logging;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "pipe-cache-client")]
#[command(version)]
#[command(about = "Send a command to the pipe-cache server", long_about = None)]
struct Args {
    /// Channel name the server listens on
    #[arg(short, long, default_value = DEFAULT_PIPE_NAME)]
    name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Command to send, e.g. `SET city dubai`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

const DEMO: [&str; 3] = ["SET city dubai", "GET city", "G city"];

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_level);

    if args.command.is_empty() {
        for command in DEMO {
            match send_command(&args.name, command).await {
                Ok(response) => println!("{command} -> {response}"),
                Err(e) => println!("{command} -> Error: {e}"),
            }
        }
        return ExitCode::SUCCESS;
    }

    let command = args.command.join(" ");
    match send_command(&args.name, &command).await {
        Ok(response) => {
            println!("{response}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
