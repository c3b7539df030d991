use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use tether_bus_common::SESSION_BUS_ADDRESS_ENV;

/// Tether sample D-Bus service
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Log level: OFF, ERROR, WARN, INFO, DEBUG, TRACE
    #[clap(short, long, value_parser, default_value_t = LevelFilter::Info)]
    pub log_level: log::LevelFilter,

    /// Private bus address. Session bus is used if not set
    #[clap(short, long, env = SESSION_BUS_ADDRESS_ENV)]
    pub address: Option<String>,

    /// Connect to the system bus. Overrides the address
    #[clap(short, long)]
    pub system: bool,

    /// Use an in-process loopback bus. Overrides other bus options
    #[clap(long)]
    pub loopback: bool,

    /// JSON file with additional interface subscriptions
    #[clap(short, long, value_parser)]
    pub config: Option<PathBuf>,

    /// Drive the connection by a service thread instead of the main loop
    #[clap(short, long)]
    pub thread: bool,
}
