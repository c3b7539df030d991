//! Watch and timeout bridge.
//!
//! The native library asks its owner to watch descriptors and fire timers. [Bridge] answers
//! these requests by registering one [Context] per native watch or timeout with a [Reactor].
//! A context is attached to its native object through the object data slot, so removal and
//! toggling always find the single registered context.

use std::{
    fmt,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::{
    native::{
        DispatchStatus, NativeConnection, NativeTimeout, NativeWatch, TimeoutFunctions,
        WatchFlags, WatchFunctions, WatchStatus,
    },
    reactor::{Event, Handler, Reactor, SourceId, TimerHandler},
};

/// Sleep before retrying a watch or dispatch which has run out of memory
const NEED_MEMORY_BACKOFF: Duration = Duration::from_millis(100);
const NEED_MEMORY_ATTEMPTS: usize = 10;

/// Interval reported once the native timeout is gone. The next expiry unregisters the context
const DETACHED_INTERVAL: Duration = Duration::from_secs(1);

/// Dispatch every complete incoming message of `connection`
pub(crate) fn dispatch_pending(connection: &dyn NativeConnection) {
    let mut attempts = 0;

    loop {
        match connection.dispatch() {
            DispatchStatus::DataRemains => {}
            DispatchStatus::Complete => return,
            DispatchStatus::NeedMemory => {
                attempts += 1;
                if attempts >= NEED_MEMORY_ATTEMPTS {
                    warn!("Giving up dispatch after {attempts} out of memory retries");
                    return;
                }

                thread::sleep(NEED_MEMORY_BACKOFF);
            }
        }
    }
}

pub(crate) fn watch_events(flags: WatchFlags) -> Event {
    let mut events = Event::NONE;

    if flags.contains(WatchFlags::READABLE) {
        events |= Event::READABLE;
    }
    if flags.contains(WatchFlags::WRITABLE) {
        events |= Event::WRITABLE;
    }
    if flags.contains(WatchFlags::ERROR) {
        events |= Event::ERROR;
    }
    if flags.contains(WatchFlags::HANGUP) {
        events |= Event::HANGUP;
    }

    events
}

pub(crate) fn native_flags(events: Event) -> WatchFlags {
    let mut flags = WatchFlags::empty();

    if events.contains(Event::READABLE) {
        flags = flags | WatchFlags::READABLE;
    }
    if events.contains(Event::WRITABLE) {
        flags = flags | WatchFlags::WRITABLE;
    }
    if events.contains(Event::ERROR) {
        flags = flags | WatchFlags::ERROR;
    }
    if events.contains(Event::HANGUP) {
        flags = flags | WatchFlags::HANGUP;
    }

    flags
}

struct ContextState {
    events: Event,
    /// `None` once unregistered
    source: Option<SourceId>,
}

/// Reactor source representing one native watch or timeout
pub struct Context {
    name: String,
    connection: Weak<dyn NativeConnection>,
    target: Target,
    /// Duplicate of the watched descriptor. `None` for timeouts
    fd: Option<OwnedFd>,
    /// Descriptor number reported by the native watch
    native_fd: RawFd,
    state: Mutex<ContextState>,
}

enum Target {
    Watch(Weak<dyn NativeWatch>),
    Timeout(Weak<dyn NativeTimeout>),
}

impl Context {
    fn is_registered(&self) -> bool {
        self.state.lock().source.is_some()
    }

    /// Detach from the reactor. The context never fires again
    fn detach(&self, reactor: &dyn Reactor) {
        if let Some(source) = self.state.lock().source.take() {
            trace!("{}: unregistering source {source:?}", self.name);
            reactor.remove(source);
        }
    }

    fn source(&self) -> Option<SourceId> {
        self.state.lock().source
    }

    fn dispatch(&self) {
        if let Some(connection) = self.connection.upgrade() {
            dispatch_pending(connection.as_ref());
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("fd", &self.native_fd)
            .field("source", &state.source)
            .finish()
    }
}

impl Handler for Context {
    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn events(&self) -> Event {
        self.state.lock().events
    }

    fn call(&self, events: Event) -> bool {
        if !self.is_registered() {
            return false;
        }

        let Target::Watch(ref watch) = self.target else {
            return false;
        };
        let Some(watch) = watch.upgrade() else {
            return false;
        };

        let flags = native_flags(events);
        let mut attempts = 0;

        loop {
            match watch.handle(flags) {
                WatchStatus::Handled => break,
                WatchStatus::NeedMemory => {
                    attempts += 1;
                    if attempts >= NEED_MEMORY_ATTEMPTS {
                        warn!("{}: watch is still out of memory, will retry", self.name);
                        return true;
                    }

                    debug!("{}: watch needs memory, retrying", self.name);
                    thread::sleep(NEED_MEMORY_BACKOFF);
                }
                WatchStatus::Failed => {
                    error!("{}: failed to handle watch {}", self.name, self.native_fd);
                    return false;
                }
            }
        }

        self.dispatch();
        true
    }
}

impl TimerHandler for Context {
    fn interval(&self) -> Duration {
        match &self.target {
            Target::Timeout(timeout) => timeout
                .upgrade()
                .map(|t| t.interval())
                .unwrap_or(DETACHED_INTERVAL),
            Target::Watch(_) => DETACHED_INTERVAL,
        }
    }

    fn call(&self) -> bool {
        if !self.is_registered() {
            return false;
        }

        let Target::Timeout(ref timeout) = self.target else {
            return false;
        };
        let Some(timeout) = timeout.upgrade() else {
            return false;
        };

        if !timeout.handle() {
            debug!("{}: timeout needs memory, will retry", self.name);
        }

        self.dispatch();
        true
    }
}

fn context_of(data: Option<Arc<dyn std::any::Any + Send + Sync>>) -> Option<Arc<Context>> {
    data.and_then(|data| data.downcast::<Context>().ok())
}

/// Watch and timeout functions forwarding native registrations into a reactor
pub struct Bridge {
    name: String,
    connection: Weak<dyn NativeConnection>,
    reactor: Arc<dyn Reactor>,
}

impl Bridge {
    pub fn new(
        name: &str,
        connection: &Arc<dyn NativeConnection>,
        reactor: Arc<dyn Reactor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            connection: Arc::downgrade(connection),
            reactor,
        })
    }

    fn new_context(
        &self,
        fd: Option<OwnedFd>,
        native_fd: RawFd,
        events: Event,
        target: Target,
    ) -> Arc<Context> {
        Arc::new(Context {
            name: self.name.clone(),
            connection: self.connection.clone(),
            target,
            fd,
            native_fd,
            state: Mutex::new(ContextState {
                events,
                source: None,
            }),
        })
    }
}

impl WatchFunctions for Bridge {
    fn add_watch(&self, watch: &Arc<dyn NativeWatch>) -> bool {
        if let Some(previous) = context_of(watch.data()) {
            previous.detach(self.reactor.as_ref());
        }

        let fd = match watch.fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(err) => {
                error!(
                    "{}: failed to duplicate descriptor {}: {err}",
                    self.name,
                    watch.fd().as_raw_fd()
                );
                return false;
            }
        };

        let context = self.new_context(
            Some(fd),
            watch.fd().as_raw_fd(),
            watch_events(watch.flags()),
            Target::Watch(Arc::downgrade(watch)),
        );
        watch.set_data(Some(context.clone()));

        let source = self.reactor.insert(context.clone(), watch.enabled());
        context.state.lock().source = Some(source);

        debug!(
            "{}: watching descriptor {} for {:?}",
            self.name,
            watch.fd().as_raw_fd(),
            watch.flags()
        );
        true
    }

    fn remove_watch(&self, watch: &Arc<dyn NativeWatch>) {
        let Some(context) = context_of(watch.data()) else {
            return;
        };

        watch.set_data(None);
        context.detach(self.reactor.as_ref());
        debug!(
            "{}: stopped watching descriptor {}",
            self.name,
            watch.fd().as_raw_fd()
        );
    }

    fn toggle_watch(&self, watch: &Arc<dyn NativeWatch>) {
        let Some(context) = context_of(watch.data()) else {
            return;
        };

        // A replaced descriptor needs a new source
        if context.native_fd != watch.fd().as_raw_fd() {
            self.add_watch(watch);
            return;
        }

        context.state.lock().events = watch_events(watch.flags());

        if let Some(source) = context.source() {
            self.reactor.set_enabled(source, watch.enabled());
        }
    }
}

impl TimeoutFunctions for Bridge {
    fn add_timeout(&self, timeout: &Arc<dyn NativeTimeout>) -> bool {
        if let Some(previous) = context_of(timeout.data()) {
            previous.detach(self.reactor.as_ref());
        }

        let context = self.new_context(
            None,
            -1,
            Event::NONE,
            Target::Timeout(Arc::downgrade(timeout)),
        );
        timeout.set_data(Some(context.clone()));

        let source = self.reactor.insert_timer(context.clone(), timeout.enabled());
        context.state.lock().source = Some(source);

        trace!("{}: added timeout {:?}", self.name, timeout.interval());
        true
    }

    fn remove_timeout(&self, timeout: &Arc<dyn NativeTimeout>) {
        if let Some(context) = context_of(timeout.data()) {
            timeout.set_data(None);
            context.detach(self.reactor.as_ref());
        }
    }

    fn toggle_timeout(&self, timeout: &Arc<dyn NativeTimeout>) {
        if let Some(source) = context_of(timeout.data()).and_then(|c| c.source()) {
            self.reactor.set_enabled(source, timeout.enabled());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        os::unix::net::UnixStream,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use crate::native::{DataSlot, FilterFunction, FilterId, RawMessage, Serial};
    use tether_bus_common::{Error, Result};

    use super::*;

    #[derive(Default)]
    struct RecordingReactor {
        next: AtomicUsize,
        /// Source -> enabled
        sources: Mutex<HashMap<SourceId, bool>>,
        handlers: Mutex<Vec<(SourceId, Arc<dyn Handler>)>>,
    }

    impl Reactor for RecordingReactor {
        fn insert(&self, handler: Arc<dyn Handler>, enabled: bool) -> SourceId {
            let id = SourceId::new(self.next.fetch_add(1, Ordering::SeqCst) as u64);
            self.sources.lock().insert(id, enabled);
            self.handlers.lock().push((id, handler));
            id
        }

        fn insert_timer(&self, _timer: Arc<dyn TimerHandler>, enabled: bool) -> SourceId {
            let id = SourceId::new(self.next.fetch_add(1, Ordering::SeqCst) as u64);
            self.sources.lock().insert(id, enabled);
            id
        }

        fn set_enabled(&self, id: SourceId, enabled: bool) {
            if let Some(state) = self.sources.lock().get_mut(&id) {
                *state = enabled
            }
        }

        fn remove(&self, id: SourceId) {
            self.sources.lock().remove(&id);
        }
    }

    struct FakeWatch {
        sockets: [UnixStream; 2],
        /// Index of the reported socket
        current: AtomicUsize,
        enabled: AtomicBool,
        results: Mutex<Vec<WatchStatus>>,
        handled: AtomicUsize,
        data: Mutex<DataSlot>,
    }

    impl FakeWatch {
        fn new(results: Vec<WatchStatus>) -> Arc<Self> {
            let (first, second) = UnixStream::pair().unwrap();

            Arc::new(Self {
                sockets: [first, second],
                current: AtomicUsize::new(0),
                enabled: AtomicBool::new(true),
                results: Mutex::new(results),
                handled: AtomicUsize::new(0),
                data: Mutex::new(None),
            })
        }
    }

    impl NativeWatch for FakeWatch {
        fn fd(&self) -> BorrowedFd<'_> {
            self.sockets[self.current.load(Ordering::SeqCst)].as_fd()
        }

        fn flags(&self) -> WatchFlags {
            WatchFlags::READABLE | WatchFlags::HANGUP
        }

        fn enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn handle(&self, flags: WatchFlags) -> WatchStatus {
            assert!(flags.contains(WatchFlags::READABLE));
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.results.lock().pop().unwrap_or(WatchStatus::Handled)
        }

        fn set_data(&self, data: DataSlot) {
            *self.data.lock() = data
        }

        fn data(&self) -> DataSlot {
            self.data.lock().clone()
        }
    }

    /// Native connection counting dispatch passes
    #[derive(Default)]
    struct Dispatches(AtomicUsize);

    impl NativeConnection for Dispatches {
        fn set_exit_on_disconnect(&self, _exit: bool) {}
        fn add_filter(&self, _filter: FilterFunction) -> Option<FilterId> {
            None
        }
        fn remove_filter(&self, _id: FilterId) {}
        fn set_watch_functions(&self, _f: Option<Arc<dyn WatchFunctions>>) -> bool {
            true
        }
        fn set_timeout_functions(&self, _f: Option<Arc<dyn TimeoutFunctions>>) -> bool {
            true
        }
        fn flush(&self) {}
        fn socket(&self) -> Option<RawFd> {
            None
        }
        fn unique_name(&self) -> Option<String> {
            None
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn send(&self, _message: &RawMessage) -> Result<Serial> {
            Err(Error::Closed)
        }
        fn send_with_reply(&self, _message: &RawMessage, _timeout: Duration) -> Result<Serial> {
            Err(Error::Closed)
        }
        fn send_with_reply_and_block(
            &self,
            _message: &RawMessage,
            _timeout: Duration,
        ) -> Result<Arc<RawMessage>> {
            Err(Error::Closed)
        }
        fn add_match(&self, _rule: &str) -> Result<()> {
            Ok(())
        }
        fn remove_match(&self, _rule: &str) -> Result<()> {
            Ok(())
        }
        fn read_write(&self, _timeout: Duration) -> bool {
            true
        }
        fn dispatch_status(&self) -> DispatchStatus {
            DispatchStatus::Complete
        }
        fn dispatch(&self) -> DispatchStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            DispatchStatus::Complete
        }
        fn close(&self) {}
    }

    fn setup() -> (Arc<RecordingReactor>, Arc<Dispatches>, Arc<Bridge>) {
        let reactor = Arc::new(RecordingReactor::default());
        let connection = Arc::new(Dispatches::default());
        let native: Arc<dyn NativeConnection> = connection.clone();

        let bridge = Bridge::new("test", &native, reactor.clone());
        (reactor, connection, bridge)
    }

    #[test]
    fn test_single_registration() {
        let (reactor, _connection, bridge) = setup();
        let watch = FakeWatch::new(vec![]);
        let native: Arc<dyn NativeWatch> = watch.clone();

        assert!(bridge.add_watch(&native));
        assert!(bridge.add_watch(&native));
        assert_eq!(reactor.sources.lock().len(), 1);

        watch.enabled.store(false, Ordering::SeqCst);
        bridge.toggle_watch(&native);
        bridge.toggle_watch(&native);

        {
            let sources = reactor.sources.lock();
            assert_eq!(sources.len(), 1);
            assert_eq!(sources.values().next(), Some(&false));
        }

        let context = context_of(watch.data()).unwrap();
        assert_eq!(context.native_fd, watch.sockets[0].as_raw_fd());
        assert_eq!(context.events(), Event::READABLE | Event::HANGUP);

        // The reactor polls a descriptor owned by the context
        let polled = Handler::fd(context.as_ref()).unwrap().as_raw_fd();
        assert_ne!(polled, context.native_fd);

        // Replaced descriptor
        watch.current.store(1, Ordering::SeqCst);
        watch.enabled.store(true, Ordering::SeqCst);
        bridge.toggle_watch(&native);

        let replaced = context_of(watch.data()).unwrap();
        assert_eq!(replaced.native_fd, watch.sockets[1].as_raw_fd());
        assert!(!context.is_registered());
        {
            let sources = reactor.sources.lock();
            assert_eq!(sources.len(), 1);
            assert_eq!(sources.values().next(), Some(&true));
        }

        bridge.remove_watch(&native);
        assert!(reactor.sources.lock().is_empty());
        assert!(watch.data().is_none());

        // Removed contexts never fire
        assert!(!Handler::call(context.as_ref(), Event::READABLE));
        assert!(!Handler::call(replaced.as_ref(), Event::READABLE));
        assert_eq!(watch.handled.load(Ordering::SeqCst), 0);
    }

    #[derive(Default)]
    struct FakeTimeout {
        data: Mutex<DataSlot>,
    }

    impl NativeTimeout for FakeTimeout {
        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn enabled(&self) -> bool {
            true
        }

        fn handle(&self) -> bool {
            true
        }

        fn set_data(&self, data: DataSlot) {
            *self.data.lock() = data
        }

        fn data(&self) -> DataSlot {
            self.data.lock().clone()
        }
    }

    #[test]
    fn test_detached_timeout() {
        let (_reactor, _connection, bridge) = setup();
        let timeout: Arc<dyn NativeTimeout> = Arc::new(FakeTimeout::default());
        assert!(bridge.add_timeout(&timeout));

        let context = context_of(timeout.data()).unwrap();
        assert_eq!(TimerHandler::interval(context.as_ref()), Duration::from_millis(10));
        assert!(Handler::fd(context.as_ref()).is_none());

        drop(timeout);

        // Finite interval, and the next expiry unregisters the context
        assert_eq!(TimerHandler::interval(context.as_ref()), DETACHED_INTERVAL);
        assert!(!TimerHandler::call(context.as_ref()));
    }

    #[test]
    fn test_call_dispatches() {
        let (reactor, connection, bridge) = setup();
        let watch = FakeWatch::new(vec![WatchStatus::NeedMemory]);
        let native: Arc<dyn NativeWatch> = watch.clone();
        bridge.add_watch(&native);

        let (_, handler) = reactor.handlers.lock()[0].clone();
        assert!(handler.call(Event::READABLE));

        // One retry after the out of memory report
        assert_eq!(watch.handled.load(Ordering::SeqCst), 2);
        assert_eq!(connection.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_watch() {
        let (reactor, connection, bridge) = setup();
        let watch = FakeWatch::new(vec![WatchStatus::Failed]);
        let native: Arc<dyn NativeWatch> = watch.clone();
        bridge.add_watch(&native);

        let (_, handler) = reactor.handlers.lock()[0].clone();
        assert!(!handler.call(Event::READABLE));
        assert_eq!(connection.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_flags() {
        let flags = WatchFlags::READABLE | WatchFlags::ERROR;
        assert_eq!(native_flags(watch_events(flags)), flags);
        assert_eq!(
            watch_events(WatchFlags::WRITABLE | WatchFlags::HANGUP),
            Event::WRITABLE | Event::HANGUP
        );
    }
}
