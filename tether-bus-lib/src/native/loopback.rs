//! In-process bus.
//!
//! Connections of one [LoopbackBus] exchange [RawMessage]s directly. Signals are routed by
//! match rules, method calls and replies by destination name. Each connection exposes a
//! wake-up socket as its readable watch, and a reply-timeout timer which is enabled while
//! async method calls are waiting for replies.

use std::{
    collections::{HashMap, VecDeque},
    io::{Read, Write},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::net::UnixStream,
    },
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use tether_bus_common::{
    Error, Result, DBUS_SERVICE, ERROR_MATCH_RULE_NOT_FOUND, ERROR_NO_REPLY,
    ERROR_SERVICE_UNKNOWN, ERROR_UNKNOWN_METHOD,
};

use super::{
    DataSlot, DispatchStatus, FilterFunction, FilterId, FilterResult, MessageKind,
    NativeConnection, NativeTimeout, NativeWatch, RawMessage, Serial, TimeoutFunctions,
    WatchFlags, WatchFunctions, WatchStatus,
};

const ADDRESS_PREFIX: &str = "loopback:";
const DEFAULT_BUS_NAME: &str = "default";

/// Reply timeout check period
const TIMEOUT_INTERVAL: Duration = Duration::from_millis(50);

static BUSES: OnceLock<Mutex<HashMap<String, LoopbackBus>>> = OnceLock::new();

struct BusState {
    next_id: u64,
    /// Unique name -> connection
    peers: HashMap<String, Weak<LoopbackConnection>>,
    /// Well-known name -> unique name
    names: HashMap<String, String>,
}

/// In-process message bus
#[derive(Clone)]
pub struct LoopbackBus {
    name: String,
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    /// Anonymous bus, not reachable by address
    pub fn new() -> Self {
        Self::with_name("anonymous")
    }

    fn with_name(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                peers: HashMap::new(),
                names: HashMap::new(),
            })),
        }
    }

    /// Process-wide bus registered under `name`
    pub fn named(name: &str) -> Self {
        BUSES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| Self::with_name(name))
            .clone()
    }

    /// Resolve `loopback:name=<bus>` addresses. Returns `None` for non-loopback addresses
    pub fn from_address(address: &str) -> Option<Self> {
        let params = address.strip_prefix(ADDRESS_PREFIX)?;

        let name = params
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "name")
            .map(|(_, value)| value)
            .unwrap_or(DEFAULT_BUS_NAME);

        Some(Self::named(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a new connection to the bus
    pub fn connect(&self) -> Result<Arc<LoopbackConnection>> {
        let (reader, writer) =
            UnixStream::pair().map_err(|e| Error::Connection(format!("Socket pair: {e}")))?;
        for stream in [&reader, &writer] {
            stream
                .set_nonblocking(true)
                .map_err(|e| Error::Connection(format!("Socket pair: {e}")))?;
        }

        let mut state = self.state.lock();
        let unique_name = format!(":1.{}", state.next_id);
        state.next_id += 1;

        let connection = Arc::new_cyclic(|me: &Weak<LoopbackConnection>| LoopbackConnection {
            bus: self.clone(),
            unique_name: unique_name.clone(),
            state: Mutex::new(ConnectionState::new()),
            delivered: Condvar::new(),
            wake_writer: writer,
            watch: Arc::new(LoopbackWatch {
                reader,
                data: Mutex::new(None),
                connection: me.clone(),
            }),
            timeout: Arc::new(LoopbackTimeout {
                enabled: AtomicBool::new(false),
                data: Mutex::new(None),
                connection: me.clone(),
            }),
        });

        state
            .peers
            .insert(unique_name.clone(), Arc::downgrade(&connection));

        debug!("New loopback connection '{}' on '{}'", unique_name, self.name);
        Ok(connection)
    }

    fn resolve(&self, name: &str) -> Option<Arc<LoopbackConnection>> {
        let state = self.state.lock();
        let unique = state.names.get(name).map(String::as_str).unwrap_or(name);

        state.peers.get(unique).and_then(Weak::upgrade)
    }

    fn detach(&self, unique_name: &str) {
        let mut state = self.state.lock();
        state.peers.remove(unique_name);
        state.names.retain(|_, owner| owner != unique_name);
    }

    fn route(&self, message: Arc<RawMessage>) {
        trace!(
            "Routing {} {:?}.{:?} from {:?} to {:?}",
            message.kind,
            message.interface,
            message.member,
            message.sender,
            message.destination
        );

        match message.kind {
            MessageKind::Signal if message.destination.is_none() => {
                let peers: Vec<Arc<LoopbackConnection>> = self
                    .state
                    .lock()
                    .peers
                    .values()
                    .filter_map(Weak::upgrade)
                    .collect();

                for peer in peers {
                    if peer.matches(&message) {
                        peer.deliver(message.clone())
                    }
                }
            }
            MessageKind::MethodCall => {
                let destination = message.destination.as_deref().unwrap_or_default();

                if destination == DBUS_SERVICE {
                    let text = format!(
                        "Method '{}' is not provided by the loopback bus",
                        message.member.as_deref().unwrap_or_default()
                    );
                    self.reply_error(&message, ERROR_UNKNOWN_METHOD, &text);
                } else if let Some(peer) = self.resolve(destination) {
                    peer.deliver(message)
                } else {
                    let text = format!("The name {destination} was not provided by any peer");
                    self.reply_error(&message, ERROR_SERVICE_UNKNOWN, &text);
                }
            }
            _ => match message.destination.as_deref().and_then(|d| self.resolve(d)) {
                Some(peer) => peer.deliver(message),
                None => debug!("Dropping {} to an unknown peer", message.kind),
            },
        }
    }

    fn reply_error(&self, call: &RawMessage, name: &str, text: &str) {
        if !call.expects_reply() {
            return;
        }

        let mut reply = RawMessage::error_reply(call, name, text);
        reply.sender = Some(DBUS_SERVICE.into());

        if let Some(peer) = call.sender.as_deref().and_then(|s| self.resolve(s)) {
            peer.deliver(Arc::new(reply))
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `key='value'` match rule
#[derive(Debug, Clone, PartialEq)]
struct MatchRule {
    text: String,
    kind: Option<String>,
    sender: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
}

impl MatchRule {
    fn parse(text: &str) -> Result<Self> {
        let mut rule = MatchRule {
            text: text.to_owned(),
            kind: None,
            sender: None,
            path: None,
            interface: None,
            member: None,
        };

        for pair in text.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidArgument(format!("Invalid match rule '{text}'")))?;
            let value = value.trim().trim_matches('\'').to_owned();

            match key.trim() {
                "type" => rule.kind = Some(value),
                "sender" => rule.sender = Some(value),
                "path" => rule.path = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                other => trace!("Ignoring match rule key '{other}'"),
            }
        }

        Ok(rule)
    }

    fn matches(&self, message: &RawMessage) -> bool {
        fn check(expected: &Option<String>, actual: &Option<String>) -> bool {
            match expected {
                Some(expected) => actual.as_deref() == Some(expected.as_str()),
                None => true,
            }
        }

        self.kind
            .as_deref()
            .map_or(true, |kind| kind == message.kind.to_string())
            && check(&self.sender, &message.sender)
            && check(&self.path, &message.path)
            && check(&self.interface, &message.interface)
            && check(&self.member, &message.member)
    }
}

struct ConnectionState {
    connected: bool,
    exit_on_disconnect: bool,
    next_serial: Serial,
    filters: Vec<(FilterId, FilterFunction)>,
    incoming: VecDeque<Arc<RawMessage>>,
    rules: Vec<MatchRule>,
    /// Async calls waiting for replies
    pending: HashMap<Serial, Instant>,
    /// Blocking calls waiting for replies
    blocking: HashMap<Serial, Option<Arc<RawMessage>>>,
    watch_functions: Option<Arc<dyn WatchFunctions>>,
    timeout_functions: Option<Arc<dyn TimeoutFunctions>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            connected: true,
            exit_on_disconnect: true,
            next_serial: 1,
            filters: Vec::new(),
            incoming: VecDeque::new(),
            rules: Vec::new(),
            pending: HashMap::new(),
            blocking: HashMap::new(),
            watch_functions: None,
            timeout_functions: None,
        }
    }

    fn take_serial(&mut self) -> Serial {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        serial
    }
}

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// Connection to a [LoopbackBus]
pub struct LoopbackConnection {
    bus: LoopbackBus,
    unique_name: String,
    state: Mutex<ConnectionState>,
    delivered: Condvar,
    wake_writer: UnixStream,
    watch: Arc<LoopbackWatch>,
    timeout: Arc<LoopbackTimeout>,
}

impl LoopbackConnection {
    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    /// Own a well-known name on the bus
    pub fn request_name(&self, name: &str) -> Result<()> {
        let mut state = self.bus.state.lock();

        match state.names.get(name) {
            Some(owner) if owner != &self.unique_name => Err(Error::Remote {
                name: "org.freedesktop.DBus.Error.NameTaken".into(),
                message: format!("Name '{name}' is owned by {owner}"),
            }),
            _ => {
                state.names.insert(name.into(), self.unique_name.clone());
                debug!("'{}' now owns '{}'", self.unique_name, name);
                Ok(())
            }
        }
    }

    pub fn filter_count(&self) -> usize {
        self.state.lock().filters.len()
    }

    pub fn match_rules(&self) -> Vec<String> {
        self.state
            .lock()
            .rules
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    pub fn exits_on_disconnect(&self) -> bool {
        self.state.lock().exit_on_disconnect
    }

    pub fn has_watch_functions(&self) -> bool {
        let state = self.state.lock();
        state.watch_functions.is_some() || state.timeout_functions.is_some()
    }

    /// Number of async calls waiting for replies
    pub fn pending_replies(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn matches(&self, message: &RawMessage) -> bool {
        self.state.lock().rules.iter().any(|r| r.matches(message))
    }

    fn deliver(&self, message: Arc<RawMessage>) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }

        if let Some(serial) = message.reply_serial {
            if let Some(slot) = state.blocking.get_mut(&serial) {
                *slot = Some(message);
                drop(state);

                self.delivered.notify_all();
                return;
            }

            state.pending.remove(&serial);
        }

        state.incoming.push_back(message);
        drop(state);

        self.delivered.notify_all();
        self.wake();
    }

    fn wake(&self) {
        // A full socket is readable anyway
        let _ = (&self.wake_writer).write(&[1]);
    }

    fn prepare(&self, message: &RawMessage, state: &mut ConnectionState) -> Result<RawMessage> {
        if !state.connected {
            return Err(Error::Closed);
        }

        let mut message = message.clone();
        message.serial = state.take_serial();
        message.sender = Some(self.unique_name.clone());
        message.native = None;
        Ok(message)
    }

    /// Replace timed out async calls with `NoReply` errors
    fn expire_pending(&self, now: Instant) {
        let mut state = self.state.lock();

        let expired: Vec<Serial> = state
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();

        for serial in expired.iter() {
            state.pending.remove(serial);

            let mut error = RawMessage::error(ERROR_NO_REPLY, "Did not receive a reply");
            error.reply_serial = Some(*serial);
            error.sender = Some(DBUS_SERVICE.into());
            error.destination = Some(self.unique_name.clone());
            state.incoming.push_back(Arc::new(error));
        }

        let functions = if state.pending.is_empty() && self.timeout.set_enabled(false) {
            state.timeout_functions.clone()
        } else {
            None
        };
        drop(state);

        if !expired.is_empty() {
            debug!(
                "{} call(s) of '{}' timed out",
                expired.len(),
                self.unique_name
            );
            self.delivered.notify_all();
            self.wake();
        }

        if let Some(functions) = functions {
            functions.toggle_timeout(&(self.timeout.clone() as Arc<dyn NativeTimeout>));
        }
    }

    fn drain_wake_socket(&self) {
        let mut buffer = [0u8; 64];
        while let Ok(n) = (&self.watch.reader).read(&mut buffer) {
            if n == 0 {
                break;
            }
        }
    }
}

impl NativeConnection for LoopbackConnection {
    fn set_exit_on_disconnect(&self, exit: bool) {
        self.state.lock().exit_on_disconnect = exit;
    }

    fn add_filter(&self, filter: FilterFunction) -> Option<FilterId> {
        let id = FilterId(NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed));
        self.state.lock().filters.push((id, filter));
        Some(id)
    }

    fn remove_filter(&self, id: FilterId) {
        self.state.lock().filters.retain(|(filter, _)| *filter != id);
    }

    fn set_watch_functions(&self, functions: Option<Arc<dyn WatchFunctions>>) -> bool {
        let watch: Arc<dyn NativeWatch> = self.watch.clone();

        let previous = std::mem::replace(
            &mut self.state.lock().watch_functions,
            functions.clone(),
        );

        if let Some(previous) = previous {
            previous.remove_watch(&watch);
        }

        if let Some(functions) = functions {
            if !functions.add_watch(&watch) {
                self.state.lock().watch_functions = None;
                return false;
            }
        }

        true
    }

    fn set_timeout_functions(&self, functions: Option<Arc<dyn TimeoutFunctions>>) -> bool {
        let timeout: Arc<dyn NativeTimeout> = self.timeout.clone();

        let previous = std::mem::replace(
            &mut self.state.lock().timeout_functions,
            functions.clone(),
        );

        if let Some(previous) = previous {
            previous.remove_timeout(&timeout);
        }

        if let Some(functions) = functions {
            if !functions.add_timeout(&timeout) {
                self.state.lock().timeout_functions = None;
                return false;
            }
        }

        true
    }

    fn flush(&self) {
        // Messages are delivered on send
    }

    fn socket(&self) -> Option<RawFd> {
        Some(self.watch.reader.as_raw_fd())
    }

    fn unique_name(&self) -> Option<String> {
        Some(self.unique_name.clone())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn send(&self, message: &RawMessage) -> Result<Serial> {
        let message = self.prepare(message, &mut self.state.lock())?;
        let serial = message.serial;

        self.bus.route(Arc::new(message));
        Ok(serial)
    }

    fn send_with_reply(&self, message: &RawMessage, timeout: Duration) -> Result<Serial> {
        let mut state = self.state.lock();
        let message = self.prepare(message, &mut state)?;
        let serial = message.serial;

        state.pending.insert(serial, Instant::now() + timeout);
        let functions = if self.timeout.set_enabled(true) {
            None
        } else {
            state.timeout_functions.clone()
        };
        drop(state);

        if let Some(functions) = functions {
            functions.toggle_timeout(&(self.timeout.clone() as Arc<dyn NativeTimeout>));
        }

        self.bus.route(Arc::new(message));
        Ok(serial)
    }

    fn send_with_reply_and_block(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<Arc<RawMessage>> {
        let mut state = self.state.lock();
        let message = self.prepare(message, &mut state)?;
        let serial = message.serial;

        state.blocking.insert(serial, None);
        drop(state);

        self.bus.route(Arc::new(message));

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(Some(_)) = state.blocking.get(&serial) {
                return state.blocking.remove(&serial).flatten().ok_or(Error::NoReply);
            }

            if !state.connected {
                state.blocking.remove(&serial);
                return Err(Error::Closed);
            }

            if self.delivered.wait_until(&mut state, deadline).timed_out() {
                return match state.blocking.remove(&serial).flatten() {
                    Some(reply) => Ok(reply),
                    None => Err(Error::NoReply),
                };
            }
        }
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        let rule = MatchRule::parse(rule)?;

        self.state.lock().rules.push(rule);
        Ok(())
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        let mut state = self.state.lock();

        match state.rules.iter().position(|r| r.text == rule) {
            Some(index) => {
                state.rules.remove(index);
                Ok(())
            }
            None => Err(Error::Remote {
                name: ERROR_MATCH_RULE_NOT_FOUND.into(),
                message: format!("The given match rule wasn't found: {rule}"),
            }),
        }
    }

    fn read_write(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.lock();
            if state.connected && state.incoming.is_empty() {
                self.delivered.wait_for(&mut state, timeout);
            }
        }

        self.drain_wake_socket();
        self.expire_pending(Instant::now());
        self.is_connected()
    }

    fn dispatch_status(&self) -> DispatchStatus {
        if self.state.lock().incoming.is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    fn dispatch(&self) -> DispatchStatus {
        let (message, filters) = {
            let mut state = self.state.lock();
            match state.incoming.pop_front() {
                Some(message) => {
                    let filters: Vec<FilterFunction> =
                        state.filters.iter().map(|(_, f)| f.clone()).collect();
                    (message, filters)
                }
                None => return DispatchStatus::Complete,
            }
        };

        let mut handled = false;
        for filter in filters {
            match filter(&message) {
                FilterResult::Handled => {
                    handled = true;
                    break;
                }
                FilterResult::NotYetHandled => {}
                FilterResult::NeedMemory => {
                    self.state.lock().incoming.push_front(message);
                    return DispatchStatus::NeedMemory;
                }
            }
        }

        if !handled && message.expects_reply() {
            let text = format!(
                "No such method '{}' in interface '{}'",
                message.member.as_deref().unwrap_or_default(),
                message.interface.as_deref().unwrap_or_default()
            );

            let reply = RawMessage::error_reply(&message, ERROR_UNKNOWN_METHOD, &text);
            if let Err(err) = self.send(&reply) {
                warn!("Failed to reply to an unhandled method call: {err}");
            }
        }

        self.dispatch_status()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }

        state.connected = false;
        state.incoming.clear();
        state.pending.clear();
        state.filters.clear();
        drop(state);

        self.timeout.set_enabled(false);
        self.bus.detach(&self.unique_name);
        self.delivered.notify_all();

        debug!("Loopback connection '{}' closed", self.unique_name);
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.bus.detach(&self.unique_name);
        debug!("Loopback connection '{}' was released", self.unique_name);
    }
}

/// Readable watch over the connection wake-up socket
struct LoopbackWatch {
    reader: UnixStream,
    data: Mutex<DataSlot>,
    connection: Weak<LoopbackConnection>,
}

impl NativeWatch for LoopbackWatch {
    fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn flags(&self) -> WatchFlags {
        WatchFlags::READABLE
    }

    fn enabled(&self) -> bool {
        true
    }

    fn handle(&self, flags: WatchFlags) -> WatchStatus {
        let Some(connection) = self.connection.upgrade() else {
            return WatchStatus::Failed;
        };

        if flags.contains(WatchFlags::ERROR) || flags.contains(WatchFlags::HANGUP) {
            warn!("Loopback watch of '{}' failed", connection.unique_name);
            return WatchStatus::Failed;
        }

        connection.drain_wake_socket();
        WatchStatus::Handled
    }

    fn set_data(&self, data: DataSlot) {
        *self.data.lock() = data;
    }

    fn data(&self) -> DataSlot {
        self.data.lock().clone()
    }
}

/// Reply timeout timer
struct LoopbackTimeout {
    enabled: AtomicBool,
    data: Mutex<DataSlot>,
    connection: Weak<LoopbackConnection>,
}

impl LoopbackTimeout {
    /// Returns the previous state
    fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel)
    }
}

impl NativeTimeout for LoopbackTimeout {
    fn interval(&self) -> Duration {
        TIMEOUT_INTERVAL
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn handle(&self) -> bool {
        if let Some(connection) = self.connection.upgrade() {
            connection.expire_pending(Instant::now());
        }

        true
    }

    fn set_data(&self, data: DataSlot) {
        *self.data.lock() = data;
    }

    fn data(&self) -> DataSlot {
        self.data.lock().clone()
    }
}
