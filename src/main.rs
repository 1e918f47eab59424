#[macro_use]
extern crate log;

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs::OpenOptions;

use anyhow::Error;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, TermLogger, TerminalMode, WriteLogger,
};

use crate::program::Program;

mod collector;
mod program;

/// Name of the log file written alongside the dataset.
const LOG_NAME: &str = "dataset_collector.log";

fn main() -> Result<(), Error> {
    initialize_logger();
    log_system_information();

    let program = Program::new();
    program.run()
}

/// Initializes the logger with preset filtering: everything at Info on the
/// terminal, full trace output for this crate into the log file.
fn initialize_logger() {
    let mut config = ConfigBuilder::new();
    config.add_filter_allow_str("dataset_collector");

    let log_file = match OpenOptions::new().create(true).append(true).open(LOG_NAME) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open {LOG_NAME}: {e}. Logging will only output to terminal.");
            let _ = TermLogger::init(
                LevelFilter::Info,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            );
            return;
        }
    };

    if let Err(e) = CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::max(), config.build(), log_file),
    ]) {
        eprintln!("Failed to initialize combined logger: {e}. Falling back to terminal-only logging.");
        let _ = TermLogger::init(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
