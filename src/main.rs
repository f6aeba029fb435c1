//! warrend - the warren tunnel daemon
//!
//! Loads `warren.conf` from the configuration directory, wires up every
//! component (connections list, crypter, reliable-UDP transport, front
//! multiplexer, peer sessions, tracker links, local control socket), and
//! runs until asked to shut down.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use warren::WarrenError;

/// warrend - the warren tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "warrend")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing warren.conf and the identity/CA files it names
    #[arg(short = 'c', long, default_value = "/etc/warren")]
    config_dir: PathBuf,

    /// Instance name: selects the control socket and persisted state file
    /// when multiple daemons run on one host
    #[arg(short = 'i', long, default_value = "default")]
    instance: String,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Stay attached to the controlling terminal instead of detaching
    ///
    /// This process never forks itself; accepted for CLI parity with the
    /// external management tool's expectations and left for whatever
    /// supervises this binary (systemd, runit, ...) to act on.
    #[arg(long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if !args.foreground {
        tracing::debug!("--foreground not set; this build always runs attached, nothing to detach");
    }
    tracing::info!(config_dir = %args.config_dir.display(), instance = %args.instance, "warrend starting");

    match warren::supervisor::run(args.config_dir, args.instance).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn user_message(error: &WarrenError) -> String {
    error.user_message()
}
