//! Bus connection.
//!
//! A [Connection] owns one native connection handle. Opening it installs the message filter
//! and either bridges the native watches and timeouts into a [Reactor], or starts a service
//! thread which reads and dispatches the connection. Closing removes everything that was
//! installed before the handle is released.

mod filter;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use futures::channel::oneshot;
use log::{debug, info, warn};
use parking_lot::ReentrantMutex;
use tether_bus_common::{
    config::InterfaceConfig, Error, DEFAULT_REPLY_TIMEOUT_MS, ERROR_FAILED, ERROR_NO_REPLY,
};

use crate::{
    interface::{Callback, Interface, MemberId},
    message::Message,
    native::{
        self, Address, BusType, FilterId, FilterResult, NativeConnection, RawMessage, Serial,
        TimeoutFunctions, WatchFunctions,
    },
    reactor::{MainLoop, Reactor},
    watch::{self, Bridge},
};

use filter::Core;

/// Serializes handle registration changes of all connections in the process
pub(crate) static GUARD: ReentrantMutex<()> = parking_lot::const_reentrant_mutex(());

/// Service thread read timeout
const SERVICE_STEP: Duration = Duration::from_millis(100);

const DEFAULT_NAME: &str = "dbus";

/// Connection event driving strategy
#[derive(Clone)]
pub enum Mode {
    /// Native watches and timeouts are registered with the reactor
    Reactor(Arc<dyn Reactor>),
    /// A dedicated thread reads and dispatches the connection
    ServiceThread,
}

/// Signal subscription handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    interface: String,
    member: MemberId,
}

impl Subscription {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> MemberId {
        self.member
    }
}

/// Connection builder
pub struct Builder {
    name: String,
    address: Address,
    native: Option<Arc<dyn NativeConnection>>,
    mode: Option<Mode>,
}

impl Builder {
    fn new() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            address: Address::Bus(BusType::Session),
            native: None,
            mode: None,
        }
    }

    /// Logical name used in logs
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Acquire a shared bus
    pub fn bus(mut self, bus_type: BusType) -> Self {
        self.address = Address::Bus(bus_type);
        self
    }

    /// Open a private connection to `address`
    pub fn address(mut self, address: &str) -> Self {
        self.address = Address::Private(address.into());
        self
    }

    /// Use an already opened native connection
    pub fn native(mut self, native: Arc<dyn NativeConnection>) -> Self {
        self.native = Some(native);
        self
    }

    /// Drive the connection by `reactor`. Default is [MainLoop::instance]
    pub fn reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.mode = Some(Mode::Reactor(reactor));
        self
    }

    pub fn service_thread(mut self) -> Self {
        self.mode = Some(Mode::ServiceThread);
        self
    }

    pub fn build(self) -> crate::Result<Connection> {
        native::init_threads();

        let native = match self.native {
            Some(native) => native,
            None => native::open(&self.address).map_err(|err| {
                warn!("{}: failed to connect to {}: {err}", self.name, self.address);
                err
            })?,
        };

        let strategy = match self.mode {
            Some(Mode::ServiceThread) => Strategy::ServiceThread(None),
            Some(Mode::Reactor(reactor)) => Strategy::Reactor(reactor),
            None => Strategy::Reactor(MainLoop::instance()),
        };

        let mut connection = Connection {
            core: Arc::new(Core::new(&self.name, native)),
            strategy,
            installed: Installed::default(),
            closed: false,
        };

        if let Err(err) = connection.open() {
            warn!("{}: failed to open connection: {err}", self.name);

            if let Err(close_err) = connection.shutdown() {
                debug!("{}: teardown after failed open: {close_err}", self.name);
            }
            return Err(err);
        }

        Ok(connection)
    }
}

enum Strategy {
    Reactor(Arc<dyn Reactor>),
    ServiceThread(Option<Worker>),
}

/// Registrations made by [Connection::open]
#[derive(Default)]
struct Installed {
    filter: Option<FilterId>,
    watches: bool,
    timeouts: bool,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(name: &str, native: Arc<dyn NativeConnection>) -> crate::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread_name = name.to_owned();

        let handle = thread::Builder::new()
            .name(format!("{name}-service"))
            .spawn(move || {
                debug!("{thread_name}: service thread started");

                while thread_running.load(Ordering::Acquire) {
                    if !native.read_write(SERVICE_STEP) {
                        warn!("{thread_name}: connection lost");
                        break;
                    }

                    watch::dispatch_pending(native.as_ref());
                }

                native.flush();
                debug!("{thread_name}: service thread stopped");
            })
            .map_err(|e| Error::Registration(format!("Failed to start service thread: {e}")))?;

        Ok(Self { running, handle })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Release);

        if self.handle.join().is_err() {
            warn!("Service thread panicked");
        }
    }
}

/// Bus connection
pub struct Connection {
    core: Arc<Core>,
    strategy: Strategy,
    installed: Installed,
    closed: bool,
}

impl Connection {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Shared system bus connection
    pub fn system() -> crate::Result<Self> {
        Builder::new().name("system").bus(BusType::System).build()
    }

    /// Shared session bus connection
    pub fn session() -> crate::Result<Self> {
        Builder::new().name("session").bus(BusType::Session).build()
    }

    /// Connection to the bus which has started the process
    pub fn starter() -> crate::Result<Self> {
        Builder::new().name("starter").bus(BusType::Starter).build()
    }

    /// Private connection to a bus `address`
    pub fn open_private(name: &str, address: &str) -> crate::Result<Self> {
        Builder::new().name(name).address(address).build()
    }

    fn open(&mut self) -> crate::Result<()> {
        let _guard = GUARD.lock();
        let native = self.core.native()?;
        let name = self.core.name.clone();

        native.set_exit_on_disconnect(false);

        let core = Arc::downgrade(&self.core);
        let filter = native
            .add_filter(Arc::new(move |message: &Arc<RawMessage>| match core.upgrade() {
                Some(core) => core.filter(message),
                None => FilterResult::NotYetHandled,
            }))
            .ok_or_else(|| Error::Registration("Failed to add message filter".into()))?;
        self.installed.filter = Some(filter);

        match &mut self.strategy {
            Strategy::Reactor(reactor) => {
                let bridge = Bridge::new(&name, &native, reactor.clone());
                let watches: Arc<dyn WatchFunctions> = bridge.clone();
                let timeouts: Arc<dyn TimeoutFunctions> = bridge;

                // Cleared on teardown even if rejected: the native side may have reported
                // handles before failing
                self.installed.watches = true;
                if !native.set_watch_functions(Some(watches)) {
                    return Err(Error::Registration("Failed to set watch functions".into()));
                }

                self.installed.timeouts = true;
                if !native.set_timeout_functions(Some(timeouts)) {
                    return Err(Error::Registration(
                        "Failed to set timeout functions".into(),
                    ));
                }
            }
            Strategy::ServiceThread(worker) => {
                *worker = Some(Worker::spawn(&name, native.clone())?);
            }
        }

        info!(
            "{name}: connection open as '{}'",
            native.unique_name().unwrap_or_default()
        );
        Ok(())
    }

    /// Remove the registrations and release the native handle
    fn shutdown(&mut self) -> crate::Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.closed = true;

        // The service thread must not dispatch a half closed connection
        if let Strategy::ServiceThread(worker) = &mut self.strategy {
            if let Some(worker) = worker.take() {
                worker.stop();
            }
        }

        let guard = GUARD.lock();
        let native = self.core.native.lock().take().ok_or(Error::Closed)?;
        let name = &self.core.name;

        native.flush();

        let interfaces: Vec<Interface> = self.core.interfaces.lock().drain(..).collect();
        for interface in interfaces {
            if let Err(err) = native.remove_match(&interface.rule()) {
                debug!("{name}: failed to remove '{}': {err}", interface.rule());
            }
        }

        if let Some(filter) = self.installed.filter.take() {
            native.remove_filter(filter);
        }

        if std::mem::take(&mut self.installed.watches) {
            native.set_watch_functions(None);
        }

        if std::mem::take(&mut self.installed.timeouts) {
            native.set_timeout_functions(None);
        }

        native.close();
        drop(guard);

        self.core.drop_replies();
        info!("{name}: connection closed");
        Ok(())
    }

    /// Close the connection
    pub fn close(mut self) -> crate::Result<()> {
        self.shutdown()
    }

    /// Write buffered outgoing messages. No-op on a closed connection
    pub fn flush(&self) {
        let _guard = GUARD.lock();

        if let Ok(native) = self.core.native() {
            native.flush();
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Bus assigned connection name
    pub fn unique_name(&self) -> Option<String> {
        self.core.native().ok().and_then(|n| n.unique_name())
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.core.native().map_or(false, |n| n.is_connected())
    }

    /// Subscribe to `interface.member` signals on behalf of `owner`.
    /// The interface match rule is added to the bus with the first subscription
    pub fn subscribe<F>(
        &self,
        owner: &str,
        interface: &str,
        member: &str,
        callback: F,
    ) -> crate::Result<Subscription>
    where
        F: Fn(&mut Message) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_callback(owner, interface, member, Arc::new(callback))
    }

    /// Subscribe `callback` to every member of a configured interface
    pub fn subscribe_config(
        &self,
        owner: &str,
        config: &InterfaceConfig,
        callback: Callback,
    ) -> crate::Result<Vec<Subscription>> {
        config
            .members
            .iter()
            .map(|m| self.subscribe_callback(owner, &config.interface, &m.member, callback.clone()))
            .collect()
    }

    /// Subscribe to `interface.member` signals. Signals are sent into the returned channel.
    /// The subscription is removed with the first signal after the receiver is dropped
    pub fn subscribe_stream(
        &self,
        owner: &str,
        interface: &str,
        member: &str,
    ) -> crate::Result<(Subscription, async_channel::Receiver<Message>)> {
        let (sender, receiver) = async_channel::unbounded();

        let core = Arc::downgrade(&self.core);
        let id: Arc<OnceLock<MemberId>> = Arc::new(OnceLock::new());
        let own_id = id.clone();

        let subscription = self.subscribe(owner, interface, member, move |message| {
            match sender.try_send(message.clone()) {
                Ok(()) => Ok(()),
                Err(err) if err.is_closed() => {
                    if let (Some(core), Some(id)) = (core.upgrade(), own_id.get()) {
                        debug!("{}: stream receiver dropped, unsubscribing", core.name);
                        core.unsubscribe(*id)?;
                    }
                    Ok(())
                }
                Err(err) => Err(Error::Callback(err.to_string())),
            }
        })?;

        let _ = id.set(subscription.member);
        Ok((subscription, receiver))
    }

    fn subscribe_callback(
        &self,
        owner: &str,
        interface: &str,
        member: &str,
        callback: Callback,
    ) -> crate::Result<Subscription> {
        let _guard = GUARD.lock();
        let native = self.core.native()?;

        let known = self.core.interfaces.lock().iter().any(|i| *i == *interface);
        if !known {
            let new_interface = Interface::new(interface);
            native.add_match(&new_interface.rule())?;

            debug!("{}: added match rule {}", self.core.name, new_interface.rule());
            self.core.interfaces.lock().push(new_interface);
        }

        let mut interfaces = self.core.interfaces.lock();
        let target = interfaces
            .iter_mut()
            .find(|i| **i == *interface)
            .ok_or(Error::Closed)?;

        let id = target.push_member(member, Some(owner), callback);
        debug!("{}: '{owner}' subscribed to {interface}.{member}", self.core.name);

        Ok(Subscription {
            interface: target.name().into(),
            member: id,
        })
    }

    /// Remove a subscription. Returns `false` if it was already removed
    pub fn unsubscribe(&self, subscription: &Subscription) -> crate::Result<bool> {
        self.core.unsubscribe(subscription.member)
    }

    /// Remove all subscriptions of `owner`. Returns number of removed subscriptions
    pub fn unsubscribe_all(&self, owner: &str) -> crate::Result<usize> {
        let _guard = GUARD.lock();

        let (count, emptied) = {
            let mut interfaces = self.core.interfaces.lock();

            let count = interfaces.iter_mut().map(|i| i.remove_owner(owner)).sum();

            let (emptied, kept): (Vec<Interface>, Vec<Interface>) =
                interfaces.drain(..).partition(|i| i.is_empty());
            *interfaces = kept;

            (count, emptied)
        };

        for interface in emptied {
            self.core.remove_rule(&interface)?;
        }

        Ok(count)
    }

    /// Number of subscriptions
    pub fn subscriptions(&self) -> usize {
        self.core.interfaces.lock().iter().map(|i| i.len()).sum()
    }

    /// Send a message without waiting for a reply
    pub fn send(&self, message: &Message) -> crate::Result<Serial> {
        self.core.native()?.send(message.raw())
    }

    /// Send a method call and block until the reply. Bus errors, including a reply timeout,
    /// are returned as failed messages
    pub fn call_blocking(&self, message: &Message, timeout: Duration) -> crate::Result<Message> {
        let native = self.core.native()?;

        let reply = match native.send_with_reply_and_block(message.raw(), timeout) {
            Ok(reply) => Message::from_raw(reply),
            Err(Error::NoReply) => Message::no_reply("Did not receive a reply"),
            Err(Error::Remote { name, message }) => Message::from_error(&name, &message),
            Err(err) => return Err(err),
        };

        Ok(reply.with_name(&self.core.name))
    }

    /// Call a method. `callback` receives the reply, or a `NoReply` error message
    pub fn call<F>(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        callback: F,
    ) -> crate::Result<Serial>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let message = Message::method_call(destination, path, interface, method);
        self.call_message(&message, callback)
    }

    /// Send a method call. `callback` receives the reply, or a `NoReply` error message
    pub fn call_message<F>(&self, message: &Message, callback: F) -> crate::Result<Serial>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        self.call_with_timeout(
            message,
            Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            callback,
        )
    }

    pub fn call_with_timeout<F>(
        &self,
        message: &Message,
        timeout: Duration,
        callback: F,
    ) -> crate::Result<Serial>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let native = self.core.native()?;

        // Reply can be dispatched before the send returns
        let mut replies = self.core.replies.lock();
        let serial = native.send_with_reply(message.raw(), timeout)?;
        replies.insert(serial, Box::new(callback));

        Ok(serial)
    }

    /// Send a method call and wait for the reply asynchronously
    pub async fn call_async(&self, message: &Message) -> crate::Result<Message> {
        let (sender, receiver) = oneshot::channel();

        self.call_message(message, move |reply| {
            let _ = sender.send(reply);
        })?;

        receiver.await.map_err(|_| Error::Closed)
    }

    /// Reply to `call` with an `org.freedesktop.DBus.Error.Failed` error carrying `error` text
    pub fn reply_error(&self, call: &Message, error: &Error) -> crate::Result<Serial> {
        let reply = Message::error_reply(call, ERROR_FAILED, &error.to_string());

        self.send(&reply)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        if let Err(err) = self.shutdown() {
            warn!("{}: failed to close connection: {err}", self.core.name);
        }
    }
}

/// `true` if `message` is a reply timeout
pub fn is_no_reply(message: &Message) -> bool {
    message.error_name() == Some(ERROR_NO_REPLY)
}
