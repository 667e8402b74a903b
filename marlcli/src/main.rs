use std::path::PathBuf;
use std::sync::atomic::{self, AtomicU8};

use clap::Parser;
use colored::Colorize;

/// Print an error message and exit with the given code.
macro_rules! fatal_error {
    ($code:expr, $($arg:tt)*) => {{
        eprintln!("{} {}", "error:".red().bold(), format!($($arg)*));
        std::process::exit($code)
    }};
}

mod commands;
use commands::Command;

/// Bit 0 is set when an interrupt is received. Bit 1 is set while a command can be interrupted
/// gracefully.
static RUNNING_STATE: AtomicU8 = AtomicU8::new(0);

fn interrupted() -> bool {
    RUNNING_STATE.load(atomic::Ordering::SeqCst) & 1 == 1
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = ctrlc::set_handler(|| {
        let state = RUNNING_STATE.fetch_or(1, atomic::Ordering::SeqCst);
        if state & 2 == 0 {
            std::process::exit(130);
        }
        eprintln!("{}", "Interrupt received, stopping...".yellow());
    }) {
        log::warn!("Cannot set the interrupt handler: {e}");
    }

    let cli = Cli::parse();
    cli.command.run();
}
