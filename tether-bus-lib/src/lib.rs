//! ## Tether bus lib
//!
//! D-Bus client integration layer: keeps a bus connection alive, drives it from a host
//! event loop or a service thread, and routes incoming signals to subscribers.
//!
//! ### Connection
//! [Connection::session], [Connection::system] and [Connection::starter] acquire shared buses,
//! [Connection::open_private] connects to a bus address. [Connection::builder] selects the
//! driving [connection::Mode]:
//! - [connection::Mode::Reactor]: native watches and timeouts are registered with a
//!   [reactor::Reactor]. The process [reactor::MainLoop] is used by default, someone has to run it;
//! - [connection::Mode::ServiceThread]: the connection owns a thread which reads and dispatches it.
//!
//! ### Signals
//! [Connection::subscribe] adds the interface match rule to the bus and calls the callback
//! for every matching signal. Callback errors are logged and never stop the dispatch.
//!
//! ```no_run
//! use std::thread;
//!
//! use tether_bus_lib::{reactor::MainLoop, Connection};
//!
//! let connection = Connection::session().expect("Failed to connect to the session bus");
//!
//! connection
//!     .subscribe("example", "org.gnome.ScreenSaver", "ActiveChanged", |message| {
//!         let active: bool = message.pop_as()?;
//!         println!("Screen saver active: {active}");
//!         Ok(())
//!     })
//!     .expect("Failed to subscribe");
//!
//! thread::spawn(|| MainLoop::instance().run());
//! ```
//!
//! ### Calls
//! [Connection::call] sends a method call and hands the reply to a callback,
//! [Connection::call_blocking] waits for it. A reply can be a bus error: check [Message::failed]
//! before reading the arguments.
//!
//! ### Native layer
//! The wire protocol is implemented by a [native::NativeConnection]. The crate carries an
//! in-process [native::loopback::LoopbackBus] (`loopback:name=<bus>` addresses) and, with the
//! `libdbus` feature, the system libdbus client.

pub mod connection;
pub mod interface;
pub mod message;
pub mod native;
pub mod reactor;
pub mod signal;
pub mod watch;

pub use tether_bus_common::{Error, Result};

pub use connection::{Connection, Subscription};
pub use interface::{Interface, Member};
pub use message::{Arg, Message};
pub use signal::Signal;
