//! libdbus backend.
//!
//! A [Channel] is exposed as a single native watch over its socket. Messages are converted
//! to and from [RawMessage] by walking the self-describing argument iterators.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use dbus::{
    arg::{ArgType as WireType, Iter, IterAppend},
    channel::{BusType as WireBus, Channel, Sender},
    message::MessageType,
    strings::{BusName, Interface, Member, Path, Signature},
    Message,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tether_bus_common::{
    Error, Result, Value, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, ERROR_FAILED, ERROR_NO_REPLY,
    ERROR_UNKNOWN_METHOD,
};

use super::{
    Address, BusType, DataSlot, DispatchStatus, FilterFunction, FilterId, FilterResult,
    MessageKind, NativeConnection, NativeRef, NativeTimeout, NativeWatch, RawMessage, Serial,
    SharedHandle, TimeoutFunctions, WatchFlags, WatchFunctions, WatchStatus,
};

const TIMEOUT_INTERVAL: Duration = Duration::from_millis(50);
const MATCH_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

fn connection_error(error: dbus::Error) -> Error {
    Error::Connection(error.message().unwrap_or("unknown error").to_owned())
}

fn remote_error(error: dbus::Error) -> Error {
    Error::Remote {
        name: error.name().unwrap_or(ERROR_FAILED).to_owned(),
        message: error.message().unwrap_or_default().to_owned(),
    }
}

/// Connection over the libdbus client library
pub struct LibdbusConnection {
    channel: SharedHandle<Channel>,
    exit_on_disconnect: AtomicBool,
    filters: Mutex<Vec<(FilterId, FilterFunction)>>,
    /// Async calls waiting for replies
    pending: Mutex<HashMap<Serial, Instant>>,
    /// Locally generated messages
    synthesized: Mutex<VecDeque<Arc<RawMessage>>>,
    watch: Arc<ChannelWatch>,
    timeout: Arc<ChannelTimeout>,
    watch_functions: Mutex<Option<Arc<dyn WatchFunctions>>>,
    timeout_functions: Mutex<Option<Arc<dyn TimeoutFunctions>>>,
}

impl LibdbusConnection {
    pub fn open(address: &Address) -> Result<Arc<Self>> {
        let mut channel = match address {
            Address::Bus(bus_type) => {
                let bus_type = match bus_type {
                    BusType::System => WireBus::System,
                    BusType::Session => WireBus::Session,
                    BusType::Starter => WireBus::Starter,
                };

                Channel::get_private(bus_type).map_err(connection_error)?
            }
            Address::Private(address) => {
                let mut channel = Channel::open_private(address).map_err(connection_error)?;
                channel.register().map_err(connection_error)?;
                channel
            }
        };

        channel.set_watch_enabled(true);
        let watch = channel.watch();

        // SAFETY: the channel owns the socket and is open here
        let fd = unsafe { BorrowedFd::borrow_raw(watch.fd) }
            .try_clone_to_owned()
            .map_err(|e| Error::Connection(format!("Failed to duplicate bus socket: {e}")))?;

        debug!(
            "Connected to {address} as '{}'",
            channel.unique_name().unwrap_or_default()
        );

        Ok(Arc::new_cyclic(|me: &Weak<LibdbusConnection>| Self {
            channel: SharedHandle::new(channel),
            exit_on_disconnect: AtomicBool::new(true),
            filters: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            synthesized: Mutex::new(VecDeque::new()),
            watch: Arc::new(ChannelWatch {
                socket: watch.fd,
                fd,
                read: watch.read,
                write: watch.write,
                data: Mutex::new(None),
                connection: me.clone(),
            }),
            timeout: Arc::new(ChannelTimeout {
                enabled: AtomicBool::new(false),
                data: Mutex::new(None),
                connection: me.clone(),
            }),
            watch_functions: Mutex::new(None),
            timeout_functions: Mutex::new(None),
        }))
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.get()
    }

    fn with_channel<T>(&self, f: impl FnOnce(&Channel) -> Result<T>) -> Result<T> {
        self.channel.with(f)
    }

    fn handle_watch(&self) -> WatchStatus {
        let result = self.with_channel(|channel| {
            channel
                .read_write(Some(Duration::ZERO))
                .map_err(|_| Error::Connection("Connection lost".into()))
        });

        match result {
            Ok(()) => WatchStatus::Handled,
            Err(err) => {
                warn!("Failed to handle d-bus watch: {err}");
                if self.exit_on_disconnect.load(Ordering::Acquire) {
                    std::process::exit(1);
                }
                WatchStatus::Failed
            }
        }
    }

    fn expire_pending(&self, now: Instant) {
        let mut pending = self.pending.lock();

        let expired: Vec<Serial> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();

        for serial in expired {
            pending.remove(&serial);

            let mut error = RawMessage::error(ERROR_NO_REPLY, "Did not receive a reply");
            error.reply_serial = Some(serial);
            error.sender = Some(DBUS_SERVICE.into());
            self.synthesized.lock().push_back(Arc::new(error));
        }

        let stop = pending.is_empty() && self.timeout.enabled.swap(false, Ordering::AcqRel);
        drop(pending);

        if stop {
            self.toggle_timeout();
        }
    }

    fn toggle_timeout(&self) {
        let functions = self.timeout_functions.lock().clone();

        if let Some(functions) = functions {
            functions.toggle_timeout(&(self.timeout.clone() as Arc<dyn NativeTimeout>));
        }
    }

    fn next_message(&self) -> Option<Arc<RawMessage>> {
        if let Some(message) = self.synthesized.lock().pop_front() {
            return Some(message);
        }

        let message = self.channel()?.pop_message()?;
        Some(Arc::new(decode(message)))
    }

    fn call_bus(&self, method: &str, rule: &str) -> Result<()> {
        let mut call = RawMessage::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, method);
        call.args.push(Value::String(rule.into()));

        let message = encode(&call)?;
        self.with_channel(|channel| {
            channel
                .send_with_reply_and_block(message, MATCH_TIMEOUT)
                .map(|_| ())
                .map_err(remote_error)
        })
    }
}

impl NativeConnection for LibdbusConnection {
    fn set_exit_on_disconnect(&self, exit: bool) {
        self.exit_on_disconnect.store(exit, Ordering::Release);
    }

    fn add_filter(&self, filter: FilterFunction) -> Option<FilterId> {
        let id = FilterId(NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed));
        self.filters.lock().push((id, filter));
        Some(id)
    }

    fn remove_filter(&self, id: FilterId) {
        self.filters.lock().retain(|(filter, _)| *filter != id);
    }

    fn set_watch_functions(&self, functions: Option<Arc<dyn WatchFunctions>>) -> bool {
        let watch: Arc<dyn NativeWatch> = self.watch.clone();
        let previous = std::mem::replace(&mut *self.watch_functions.lock(), functions.clone());

        if let Some(previous) = previous {
            previous.remove_watch(&watch);
        }

        match functions {
            Some(functions) if !functions.add_watch(&watch) => {
                *self.watch_functions.lock() = None;
                false
            }
            _ => true,
        }
    }

    fn set_timeout_functions(&self, functions: Option<Arc<dyn TimeoutFunctions>>) -> bool {
        let timeout: Arc<dyn NativeTimeout> = self.timeout.clone();
        let previous =
            std::mem::replace(&mut *self.timeout_functions.lock(), functions.clone());

        if let Some(previous) = previous {
            previous.remove_timeout(&timeout);
        }

        match functions {
            Some(functions) if !functions.add_timeout(&timeout) => {
                *self.timeout_functions.lock() = None;
                false
            }
            _ => true,
        }
    }

    fn flush(&self) {
        if let Some(channel) = self.channel() {
            channel.flush();
        }
    }

    fn socket(&self) -> Option<RawFd> {
        Some(self.watch.socket)
    }

    fn unique_name(&self) -> Option<String> {
        self.channel()
            .and_then(|c| c.unique_name().map(str::to_owned))
    }

    fn is_connected(&self) -> bool {
        self.channel().map_or(false, |c| c.is_connected())
    }

    fn send(&self, message: &RawMessage) -> Result<Serial> {
        let message = encode(message)?;

        self.with_channel(|channel| {
            let serial = channel
                .send(message)
                .map_err(|_| Error::Connection("Failed to send a message".into()))?;
            channel.flush();
            Ok(serial)
        })
    }

    fn send_with_reply(&self, message: &RawMessage, timeout: Duration) -> Result<Serial> {
        // Locked to register the serial before the reply can be dispatched
        let mut pending = self.pending.lock();
        let serial = self.send(message)?;
        pending.insert(serial, Instant::now() + timeout);
        drop(pending);

        if !self.timeout.enabled.swap(true, Ordering::AcqRel) {
            self.toggle_timeout();
        }

        Ok(serial)
    }

    fn send_with_reply_and_block(
        &self,
        message: &RawMessage,
        timeout: Duration,
    ) -> Result<Arc<RawMessage>> {
        let message = encode(message)?;

        let reply = self.with_channel(|channel| {
            channel
                .send_with_reply_and_block(message, timeout)
                .map_err(|e| match e.name() {
                    Some(ERROR_NO_REPLY) => Error::NoReply,
                    _ => remote_error(e),
                })
        })?;

        Ok(Arc::new(decode(reply)))
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        self.call_bus("AddMatch", rule)
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        self.call_bus("RemoveMatch", rule)
    }

    fn read_write(&self, timeout: Duration) -> bool {
        let connected = self
            .with_channel(|channel| {
                channel
                    .read_write(Some(timeout))
                    .map_err(|_| Error::Connection("Connection lost".into()))
            })
            .is_ok();

        self.expire_pending(Instant::now());
        connected
    }

    fn dispatch_status(&self) -> DispatchStatus {
        if self.synthesized.lock().is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    fn dispatch(&self) -> DispatchStatus {
        let Some(message) = self.next_message() else {
            return DispatchStatus::Complete;
        };

        if let Some(serial) = message.reply_serial {
            self.pending.lock().remove(&serial);
        }

        let filters: Vec<FilterFunction> =
            self.filters.lock().iter().map(|(_, f)| f.clone()).collect();

        let mut handled = false;
        for filter in filters {
            match filter(&message) {
                FilterResult::Handled => {
                    handled = true;
                    break;
                }
                FilterResult::NotYetHandled => {}
                FilterResult::NeedMemory => {
                    self.synthesized.lock().push_front(message);
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

        DispatchStatus::DataRemains
    }

    fn close(&self) {
        // The private channel closes when its last user releases it
        if self.channel.take().is_some() {
            self.pending.lock().clear();
            self.synthesized.lock().clear();
            debug!("Closed d-bus channel");
        }
    }
}

struct ChannelWatch {
    /// Channel socket number
    socket: RawFd,
    /// Duplicate of the channel socket, valid for the lifetime of the watch
    fd: OwnedFd,
    read: bool,
    write: bool,
    data: Mutex<DataSlot>,
    connection: Weak<LibdbusConnection>,
}

impl NativeWatch for ChannelWatch {
    fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn flags(&self) -> WatchFlags {
        let mut flags = WatchFlags::ERROR | WatchFlags::HANGUP;
        if self.read {
            flags = flags | WatchFlags::READABLE;
        }
        if self.write {
            flags = flags | WatchFlags::WRITABLE;
        }
        flags
    }

    fn enabled(&self) -> bool {
        true
    }

    fn handle(&self, _flags: WatchFlags) -> WatchStatus {
        match self.connection.upgrade() {
            Some(connection) => connection.handle_watch(),
            None => WatchStatus::Failed,
        }
    }

    fn set_data(&self, data: DataSlot) {
        *self.data.lock() = data;
    }

    fn data(&self) -> DataSlot {
        self.data.lock().clone()
    }
}

struct ChannelTimeout {
    enabled: AtomicBool,
    data: Mutex<DataSlot>,
    connection: Weak<LibdbusConnection>,
}

impl NativeTimeout for ChannelTimeout {
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

fn decode(mut message: Message) -> RawMessage {
    let kind = match message.msg_type() {
        MessageType::MethodCall => MessageKind::MethodCall,
        MessageType::MethodReturn => MessageKind::MethodReturn,
        MessageType::Error => MessageKind::Error,
        MessageType::Signal => MessageKind::Signal,
    };

    let args = read_all(&mut message.iter_init());

    let error_name = match kind {
        MessageKind::Error => message
            .as_result()
            .err()
            .and_then(|e| e.name().map(str::to_owned)),
        _ => None,
    };

    let raw = RawMessage {
        kind,
        serial: message.get_serial().unwrap_or_default(),
        reply_serial: message.get_reply_serial(),
        sender: message.sender().map(|s| s.to_string()),
        destination: message.destination().map(|d| d.to_string()),
        path: message.path().map(|p| p.to_string()),
        interface: message.interface().map(|i| i.to_string()),
        member: message.member().map(|m| m.to_string()),
        error_name,
        no_reply: message.get_no_reply(),
        args,
        native: None,
        in_reply_to: None,
    };

    trace!("Decoded {} with {} argument(s)", raw.kind, raw.args.len());

    let native: NativeRef = Arc::new(Mutex::new(message));
    RawMessage {
        native: Some(native),
        ..raw
    }
}

fn read_all(iter: &mut Iter) -> Vec<Value> {
    let mut values = Vec::new();

    while iter.arg_type() != WireType::Invalid {
        match read_value(iter) {
            Some(value) => values.push(value),
            None => trace!("Skipping unsupported argument {:?}", iter.arg_type()),
        }

        if !iter.next() {
            break;
        }
    }

    values
}

fn read_value(iter: &mut Iter) -> Option<Value> {
    match iter.arg_type() {
        WireType::Boolean => iter.get::<bool>().map(Value::Boolean),
        WireType::Byte => iter.get::<u8>().map(Value::Byte),
        WireType::Int16 => iter.get::<i16>().map(Value::Int16),
        WireType::UInt16 => iter.get::<u16>().map(Value::UInt16),
        WireType::Int32 => iter.get::<i32>().map(Value::Int32),
        WireType::UInt32 => iter.get::<u32>().map(Value::UInt32),
        WireType::Int64 => iter.get::<i64>().map(Value::Int64),
        WireType::UInt64 => iter.get::<u64>().map(Value::UInt64),
        WireType::Double => iter.get::<f64>().map(Value::Double),
        WireType::String => iter.get::<&str>().map(|s| Value::String(s.to_owned())),
        WireType::ObjectPath => iter.get::<Path>().map(|p| Value::ObjectPath(p.to_string())),
        WireType::Signature => iter
            .get::<Signature>()
            .map(|s| Value::Signature(s.to_string())),
        WireType::Variant => {
            let mut inner = iter.recurse(WireType::Variant)?;
            read_value(&mut inner).map(|v| Value::Variant(Box::new(v)))
        }
        WireType::Struct => {
            let mut inner = iter.recurse(WireType::Struct)?;
            Some(Value::Struct(read_all(&mut inner)))
        }
        WireType::Array => {
            let signature = iter.signature().to_string();
            let element = signature.get(1..).unwrap_or_default().to_owned();
            let mut inner = iter.recurse(WireType::Array)?;

            match element.strip_prefix('{').and_then(|e| e.strip_suffix('}')) {
                Some(entry) => {
                    let key = entry.get(..1)?.to_owned();
                    let value = entry.get(1..)?.to_owned();
                    let entries = read_entries(&mut inner);

                    Some(Value::Dict {
                        key,
                        value,
                        entries,
                    })
                }
                None => Some(Value::Array {
                    element,
                    items: read_all(&mut inner),
                }),
            }
        }
        _ => None,
    }
}

fn read_entries(iter: &mut Iter) -> Vec<(Value, Value)> {
    let mut entries = Vec::new();

    while iter.arg_type() == WireType::DictEntry {
        if let Some(mut entry) = iter.recurse(WireType::DictEntry) {
            let key = read_value(&mut entry);
            entry.next();
            let value = read_value(&mut entry);

            if let (Some(key), Some(value)) = (key, value) {
                entries.push((key, value));
            }
        }

        if !iter.next() {
            break;
        }
    }

    entries
}

fn call_of(raw: &RawMessage) -> Result<Arc<Mutex<Message>>> {
    raw.in_reply_to
        .clone()
        .and_then(|call| call.downcast::<Mutex<Message>>().ok())
        .ok_or_else(|| Error::InvalidArgument("Reply is not bound to a received call".into()))
}

fn name_error(error: String) -> Error {
    Error::Serialization(error)
}

fn encode(raw: &RawMessage) -> Result<Message> {
    let field = |value: &Option<String>, name: &str| {
        value
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("Missing message {name}")))
    };

    let mut message = match raw.kind {
        MessageKind::MethodCall => Message::new_method_call(
            BusName::new(field(&raw.destination, "destination")?).map_err(name_error)?,
            Path::new(field(&raw.path, "path")?).map_err(name_error)?,
            Interface::new(field(&raw.interface, "interface")?).map_err(name_error)?,
            Member::new(field(&raw.member, "member")?).map_err(name_error)?,
        )
        .map_err(name_error)?,
        MessageKind::Signal => Message::new_signal(
            Path::new(field(&raw.path, "path")?).map_err(name_error)?,
            Interface::new(field(&raw.interface, "interface")?).map_err(name_error)?,
            Member::new(field(&raw.member, "member")?).map_err(name_error)?,
        )
        .map_err(name_error)?,
        MessageKind::MethodReturn => call_of(raw)?.lock().method_return(),
        MessageKind::Error => {
            let call = call_of(raw)?;
            let name = field(&raw.error_name, "error name")?;
            let text = raw.error_text().unwrap_or_default();

            let message = Message::new_error(&call.lock(), &name, text);
            message.ok_or_else(|| Error::Serialization(format!("Invalid error name '{name}'")))?
        }
    };

    message.set_no_reply(raw.no_reply);

    let skip = usize::from(raw.kind == MessageKind::Error);
    let mut append = IterAppend::new(&mut message);
    for value in raw.args.iter().skip(skip) {
        append_value(&mut append, value)?;
    }

    Ok(message)
}

fn signature(signature: &str) -> Result<Signature<'static>> {
    Signature::new(signature.to_owned()).map_err(name_error)
}

fn append_all<'a, 'v>(
    append: &mut IterAppend<'a>,
    values: impl Iterator<Item = &'v Value>,
) -> Result<()> {
    for value in values {
        append_value(append, value)?;
    }
    Ok(())
}

fn append_value(append: &mut IterAppend, value: &Value) -> Result<()> {
    let mut result = Ok(());

    match value {
        Value::Boolean(v) => append.append(*v),
        Value::Byte(v) => append.append(*v),
        Value::Int16(v) => append.append(*v),
        Value::UInt16(v) => append.append(*v),
        Value::Int32(v) => append.append(*v),
        Value::UInt32(v) => append.append(*v),
        Value::Int64(v) => append.append(*v),
        Value::UInt64(v) => append.append(*v),
        Value::Double(v) => append.append(*v),
        Value::String(v) => append.append(v.as_str()),
        Value::ObjectPath(v) => append.append(Path::new(v.as_str()).map_err(name_error)?),
        Value::Signature(v) => append.append(signature(v)?),
        Value::Array { element, items } => {
            append.append_array(&signature(element)?, |inner| {
                result = append_all(inner, items.iter())
            });
        }
        Value::Struct(items) => {
            append.append_struct(|inner| result = append_all(inner, items.iter()));
        }
        Value::Variant(inner_value) => {
            append.append_variant(&signature(&inner_value.signature())?, |inner| {
                result = append_value(inner, inner_value)
            });
        }
        Value::Dict {
            key,
            value,
            entries,
        } => {
            append.append_dict(&signature(key)?, &signature(value)?, |inner| {
                for (k, v) in entries {
                    inner.append_dict_entry(|entry| {
                        if result.is_ok() {
                            result = append_value(entry, k).and_then(|_| append_value(entry, v));
                        }
                    });
                }
            });
        }
    }

    result
}
