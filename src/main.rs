//! eos-test - regression tests for qemu-eos camera emulation
//!
//! Drives emulated cams through scripted key presses and checks their
//! screens and logs against golden references.

use clap::Parser;
use commands::Commands;
use eostest::{cli, commands};

#[derive(Parser)]
#[command(name = "eos-test", about = "Regression test harness for qemu-eos")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli::dispatch(cli.command).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}
