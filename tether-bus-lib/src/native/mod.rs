//! Native bus client contract.
//!
//! The wire encoding of the protocol belongs to a native client library. The library
//! consumes it through [NativeConnection], [NativeWatch] and [NativeTimeout], which mirror
//! the model of the reference D-Bus client: a connection runs message filters on dispatch
//! and asks its owner to watch descriptors and timers for it.
//!
//! Backends:
//! - [loopback]: an in-process bus, addressed as `loopback:name=<bus name>`;
//! - `libdbus` (feature `libdbus`): the system D-Bus client library.

use std::{
    any::Any,
    fmt::{self, Display, Formatter},
    ops::BitOr,
    os::fd::{BorrowedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::debug;
use parking_lot::Mutex;
use tether_bus_common::{Error, Result, Value};

#[cfg(feature = "libdbus")]
pub mod libdbus;
pub mod loopback;

pub type Serial = u32;

/// Opaque object attached to a native watch or timeout
pub type DataSlot = Option<Arc<dyn Any + Send + Sync>>;

/// Native object a message was decoded from, or replies to
pub type NativeRef = Arc<dyn Any + Send + Sync>;

/// Message filter. Called for every dispatched message before the default processing
pub type FilterFunction = Arc<dyn Fn(&Arc<RawMessage>) -> FilterResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        };
        f.write_str(name)
    }
}

/// Native message object
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub kind: MessageKind,
    /// Zero until the message is sent
    pub serial: Serial,
    pub reply_serial: Option<Serial>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub no_reply: bool,
    pub args: Vec<Value>,
    /// Backend object this message was decoded from
    pub native: Option<NativeRef>,
    /// Backend object of the call this message replies to
    pub in_reply_to: Option<NativeRef>,
}

impl RawMessage {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            no_reply: false,
            args: Vec::new(),
            native: None,
            in_reply_to: None,
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, method: &str) -> Self {
        Self {
            destination: Some(destination.to_owned()),
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(method.to_owned()),
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::empty(MessageKind::Signal)
        }
    }

    pub fn method_return(call: &RawMessage) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            in_reply_to: call.native.clone(),
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// Error reply to `call`
    pub fn error_reply(call: &RawMessage, name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            in_reply_to: call.native.clone(),
            ..Self::error(name, text)
        }
    }

    /// Standalone error object, not bound to a call
    pub fn error(name: &str, text: &str) -> Self {
        Self {
            error_name: Some(name.to_owned()),
            args: vec![Value::String(text.to_owned())],
            ..Self::empty(MessageKind::Error)
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.no_reply
    }

    /// Error text of an error message
    pub fn error_text(&self) -> Option<&str> {
        match self.args.first() {
            Some(Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// Filter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// The message is consumed, no other filters run
    Handled,
    /// Pass the message to the next filter and to the default processing
    NotYetHandled,
    /// Retry the message later
    NeedMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    DataRemains,
    Complete,
    NeedMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Handled,
    /// Transient allocation failure. The watch should be handled again later
    NeedMemory,
    Failed,
}

/// Native watch condition flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WatchFlags(u32);

impl WatchFlags {
    pub const READABLE: WatchFlags = WatchFlags(1);
    pub const WRITABLE: WatchFlags = WatchFlags(2);
    pub const ERROR: WatchFlags = WatchFlags(4);
    pub const HANGUP: WatchFlags = WatchFlags(8);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: WatchFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for WatchFlags {
    type Output = WatchFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        WatchFlags(self.0 | rhs.0)
    }
}

/// Identifier of an installed filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub u64);

/// A descriptor the native library needs to be watched
pub trait NativeWatch: Send + Sync {
    fn fd(&self) -> BorrowedFd<'_>;

    fn flags(&self) -> WatchFlags;

    fn enabled(&self) -> bool;

    /// Descriptor became ready with `flags` conditions
    fn handle(&self, flags: WatchFlags) -> WatchStatus;

    fn set_data(&self, data: DataSlot);

    fn data(&self) -> DataSlot;
}

/// A timer the native library needs to be fired
pub trait NativeTimeout: Send + Sync {
    fn interval(&self) -> Duration;

    fn enabled(&self) -> bool;

    /// Timer expired. Returns `false` if the native library is out of memory
    fn handle(&self) -> bool;

    fn set_data(&self, data: DataSlot);

    fn data(&self) -> DataSlot;
}

/// Watch registration callbacks
pub trait WatchFunctions: Send + Sync {
    fn add_watch(&self, watch: &Arc<dyn NativeWatch>) -> bool;

    fn remove_watch(&self, watch: &Arc<dyn NativeWatch>);

    fn toggle_watch(&self, watch: &Arc<dyn NativeWatch>);
}

/// Timeout registration callbacks
pub trait TimeoutFunctions: Send + Sync {
    fn add_timeout(&self, timeout: &Arc<dyn NativeTimeout>) -> bool;

    fn remove_timeout(&self, timeout: &Arc<dyn NativeTimeout>);

    fn toggle_timeout(&self, timeout: &Arc<dyn NativeTimeout>);
}

/// Native connection handle
pub trait NativeConnection: Send + Sync {
    /// Terminate the process if the bus link drops
    fn set_exit_on_disconnect(&self, exit: bool);

    fn add_filter(&self, filter: FilterFunction) -> Option<FilterId>;

    fn remove_filter(&self, id: FilterId);

    /// Install watch callbacks. Existing watches are reported to the new functions at once
    /// and removed from the previous ones. `None` uninstalls the callbacks
    fn set_watch_functions(&self, functions: Option<Arc<dyn WatchFunctions>>) -> bool;

    /// Install timeout callbacks. Same semantics as [NativeConnection::set_watch_functions]
    fn set_timeout_functions(&self, functions: Option<Arc<dyn TimeoutFunctions>>) -> bool;

    /// Write buffered outgoing messages
    fn flush(&self);

    fn socket(&self) -> Option<RawFd>;

    fn unique_name(&self) -> Option<String>;

    fn is_connected(&self) -> bool;

    /// Queue a message. Returns the assigned serial
    fn send(&self, message: &RawMessage) -> Result<Serial>;

    /// Queue a method call and track its reply. If no reply arrives in `timeout`, a
    /// `NoReply` error is dispatched in its place
    fn send_with_reply(&self, message: &RawMessage, timeout: Duration) -> Result<Serial>;

    /// Send a method call and block until the reply. Error replies are returned as messages
    fn send_with_reply_and_block(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<Arc<RawMessage>>;

    fn add_match(&self, rule: &str) -> Result<()>;

    fn remove_match(&self, rule: &str) -> Result<()>;

    /// Block at most `timeout` reading incoming data. Returns `false` if disconnected
    fn read_write(&self, timeout: Duration) -> bool;

    fn dispatch_status(&self) -> DispatchStatus;

    /// Run filters over one incoming message
    fn dispatch(&self) -> DispatchStatus;

    /// Disconnect. The handle is released when the last reference is dropped
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    System,
    Session,
    Starter,
}

/// Bus to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Shared well-known bus
    Bus(BusType),
    /// Private connection to a bus address
    Private(String),
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Bus(bus_type) => write!(f, "{bus_type:?} bus"),
            Address::Private(address) => f.write_str(address),
        }
    }
}

/// Native handle shared by concurrent callers until closed.
/// The lock is held only to clone or take the handle, so a blocking call on one thread never
/// stalls another thread using the same handle
#[cfg_attr(not(feature = "libdbus"), allow(dead_code))]
pub(crate) struct SharedHandle<T>(Mutex<Option<Arc<T>>>);

#[cfg_attr(not(feature = "libdbus"), allow(dead_code))]
impl<T> SharedHandle<T> {
    pub fn new(handle: T) -> Self {
        Self(Mutex::new(Some(Arc::new(handle))))
    }

    /// `None` once taken
    pub fn get(&self) -> Option<Arc<T>> {
        self.0.lock().clone()
    }

    /// Run `f` with the handle, unlocked
    pub fn with<R>(&self, f: impl FnOnce(&T) -> Result<R>) -> Result<R> {
        let handle = self.get().ok_or(Error::Closed)?;
        f(&handle)
    }

    /// Detach the handle. It is released when the last running call returns
    pub fn take(&self) -> Option<Arc<T>> {
        self.0.lock().take()
    }
}

static THREADS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One-time multi-threading support initialization of the native library.
/// Returns `true` only for the call which has performed the initialization
pub fn init_threads() -> bool {
    if THREADS_INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }

    // libdbus threading itself is initialized by the dbus crate on the first channel
    debug!("Initializing d-bus thread system");
    true
}

/// Open a native connection to `address`
pub fn open(address: &Address) -> Result<Arc<dyn NativeConnection>> {
    if let Address::Private(address) = address {
        if let Some(bus) = loopback::LoopbackBus::from_address(address) {
            let connection: Arc<dyn NativeConnection> = bus.connect()?;
            return Ok(connection);
        }

        if address.is_empty() {
            return Err(Error::Connection("Invalid bus address".into()));
        }
    }

    #[cfg(feature = "libdbus")]
    {
        let connection: Arc<dyn NativeConnection> = libdbus::LibdbusConnection::open(address)?;
        Ok(connection)
    }

    #[cfg(not(feature = "libdbus"))]
    Err(Error::Connection(format!(
        "Can't connect to {address}: built without libdbus support"
    )))
}
