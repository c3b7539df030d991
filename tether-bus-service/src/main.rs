//! ## Tether sample service
//!
//! Connects to a bus, prints the signals it is subscribed to, asks the screen saver for its
//! active time and emits a greeting signal. Runs until Ctrl-C.
//!
//! ## Usage
//! ```sh
//! Tether sample D-Bus service
//!
//! Usage: tether-bus-service [OPTIONS]
//!
//! Options:
//!   -l, --log-level <LOG_LEVEL>  Log level: OFF, ERROR, WARN, INFO, DEBUG, TRACE [default: INFO]
//!   -a, --address <ADDRESS>      Private bus address. Session bus is used if not set [env: DBUS_SESSION_BUS_ADDRESS=]
//!   -s, --system                 Connect to the system bus. Overrides the address
//!       --loopback               Use an in-process loopback bus. Overrides other bus options
//!   -c, --config <CONFIG>        JSON file with additional interface subscriptions
//!   -t, --thread                 Drive the connection by a service thread instead of the main loop
//!   -h, --help                   Print help
//!   -V, --version                Print version
//! ```

mod args;

use std::{
    fmt::Write,
    sync::Arc,
    thread::{self, JoinHandle},
};

use clap::Parser;
use colored::*;
use log::*;
use tether_bus_common::config::InterfaceConfig;
use tether_bus_lib::{
    connection::Builder, native::BusType, reactor::MainLoop, Connection, Message, Signal,
};

const OWNER: &str = "tether-service";

const SCREENSAVER: &str = "org.gnome.ScreenSaver";
const SCREENSAVER_PATH: &str = "/org/gnome/ScreenSaver";

const HELLO_SIGNAL: &str = "com.example.signal.hello";
const HELLO_PATH: &str = "/com/example/signal";

const LOOPBACK_ADDRESS: &str = "loopback:name=tether-service";

fn print_signal(message: &mut Message) -> tether_bus_lib::Result<()> {
    println!(
        "{} {}.{} {}{}{}",
        "<<<".bright_green(),
        message.interface().unwrap_or_default(),
        message.member().unwrap_or_default().bright_yellow(),
        "(".bright_blue(),
        message,
        ")".bright_blue()
    );

    Ok(())
}

fn builder(args: &args::Args) -> Builder {
    let builder = Connection::builder().name("service");

    let builder = if args.loopback {
        builder.address(LOOPBACK_ADDRESS)
    } else if args.system {
        builder.bus(BusType::System)
    } else {
        match &args.address {
            Some(address) => builder.address(address),
            None => builder.bus(BusType::Session),
        }
    };

    if args.thread {
        builder.service_thread()
    } else {
        builder.reactor(MainLoop::instance())
    }
}

fn subscribe(connection: &Connection, args: &args::Args) -> tether_bus_lib::Result<()> {
    connection.subscribe(OWNER, SCREENSAVER, "ActiveChanged", |message| {
        let active: bool = message.pop_as()?;
        writeln!(message.info(), "Screen saver active: {active}")
            .map_err(|e| tether_bus_lib::Error::Callback(e.to_string()))
    })?;

    connection.subscribe(OWNER, "com.example.signal", "hello", print_signal)?;

    if let Some(path) = &args.config {
        for interface in InterfaceConfig::load(path)? {
            let subscriptions =
                connection.subscribe_config(OWNER, &interface, Arc::new(print_signal))?;

            info!(
                "Subscribed to {} member(s) of '{}'",
                subscriptions.len(),
                interface.interface
            );
        }
    }

    Ok(())
}

async fn query_active_time(connection: &Connection) {
    let call = Message::method_call(SCREENSAVER, SCREENSAVER_PATH, SCREENSAVER, "GetActiveTime");

    match connection.call_async(&call).await {
        Ok(mut reply) if reply.is_ok() => match reply.pop_as::<u32>() {
            Ok(seconds) => info!("Screen saver has been active for {seconds} seconds"),
            Err(err) => warn!("Unexpected GetActiveTime reply: {err}"),
        },
        Ok(reply) => warn!("GetActiveTime failed: {reply}"),
        Err(err) => warn!("Failed to call GetActiveTime: {err}"),
    }
}

fn emit_hello(connection: &Connection) -> tether_bus_lib::Result<()> {
    let mut signal = Signal::new(HELLO_SIGNAL, HELLO_PATH)?;
    signal.push_back("Hello from tether")?;

    let serial = signal.emit(connection)?;
    debug!("Emitted {HELLO_SIGNAL} #{serial}");
    Ok(())
}

fn spawn_main_loop() -> JoinHandle<()> {
    thread::spawn(|| MainLoop::instance().run())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    debug!("Starting Tether service");

    let args = args::Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(args.log_level)
        .init();

    let connection = builder(&args).build()?;
    info!(
        "Connected as '{}'",
        connection.unique_name().unwrap_or_default()
    );

    let main_loop = (!args.thread).then(spawn_main_loop);

    subscribe(&connection, &args)?;
    query_active_time(&connection).await;
    emit_hello(&connection)?;

    let _ = tokio::signal::ctrl_c().await;
    debug!("Shutting service down");

    connection.close()?;

    if let Some(handle) = main_loop {
        MainLoop::instance().quit();

        if handle.join().is_err() {
            error!("Main loop thread panicked");
        }
    }

    Ok(())
}
