use clap::Parser;
use log::{debug, error};
use ruuvitag_monitor::app::{Options, run_with_io};
use ruuvitag_monitor::radio;
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Completes on Ctrl-C. If the signal handler cannot be installed, never
/// completes and the default SIGINT behaviour applies.
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Interrupted, stopping scan"),
        Err(e) => {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let default_filter = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let radio = radio::open(options.backend, options.interface);
    let mut stdout = std::io::stdout();

    match run_with_io(options, radio, interrupted(), &mut stdout).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
