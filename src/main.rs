//! devhost - Host-side device session orchestrator
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use devhost::cli;
use devhost_session::config::CONFIG_FILENAME;

/// devhost - Manage adb/fastboot test devices from the host
#[derive(Parser, Debug)]
#[command(name = "devhost")]
#[command(about = "Host-side device session orchestrator", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serials reported by adb and fastboot
    Devices,

    /// Start services on the configured devices and hold them until Ctrl-C
    Start {
        #[arg(short, long, value_name = "FILE", default_value = CONFIG_FILENAME)]
        config: PathBuf,
    },

    /// Capture a bug report from every configured device
    Bugreport {
        #[arg(short, long, value_name = "FILE", default_value = CONFIG_FILENAME)]
        config: PathBuf,

        /// Test name recorded in the report file names
        #[arg(short, long, value_name = "NAME")]
        test: String,
    },

    /// Reboot the configured devices
    Reboot {
        #[arg(short, long, value_name = "FILE", default_value = CONFIG_FILENAME)]
        config: PathBuf,

        /// Leave services stopped after the reboot
        #[arg(long)]
        no_restart: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Devices => cli::run_devices().await,
        Command::Start { config } => cli::run_start(&config).await,
        Command::Bugreport { config, test } => cli::run_bugreport(&config, &test).await,
        Command::Reboot { config, no_restart } => cli::run_reboot(&config, !no_restart).await,
    }
}
