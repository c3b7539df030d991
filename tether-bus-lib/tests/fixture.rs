#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::LevelFilter;
use parking_lot::Mutex;
use rstest::fixture;
use tether_bus_lib::{
    native::{
        loopback::{LoopbackBus, LoopbackConnection},
        DispatchStatus, FilterResult, MessageKind, NativeConnection, RawMessage,
    },
    reactor::{Handler, MainLoop, Reactor, SourceId, TimerHandler},
    Connection,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Fixture {
    bus: LoopbackBus,
    main_loop: Arc<MainLoop>,
}

impl Fixture {
    pub fn new(log_level: LevelFilter) -> Self {
        let _ = pretty_env_logger::formatted_builder()
            .filter_level(log_level)
            .try_init();

        Self {
            bus: LoopbackBus::new(),
            main_loop: Arc::new(MainLoop::new()),
        }
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    pub fn main_loop(&self) -> Arc<MainLoop> {
        self.main_loop.clone()
    }

    /// Raw peer on the fixture bus
    pub fn peer(&self) -> Arc<LoopbackConnection> {
        self.bus.connect().expect("Failed to connect to the loopback bus")
    }

    /// Connection driven by the fixture main loop. Returns the native connection as well
    pub fn connect(&self, name: &str) -> (Connection, Arc<LoopbackConnection>) {
        let native = self.peer();

        let connection = Connection::builder()
            .name(name)
            .native(native.clone())
            .reactor(self.main_loop.clone())
            .build()
            .expect("Failed to open connection");

        (connection, native)
    }

    /// Run the main loop until `predicate` holds. Returns `false` on timeout
    pub fn wait_for(&self, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;

        while Instant::now() < deadline {
            if predicate() {
                return true;
            }

            self.main_loop.run_once(Duration::from_millis(10));
        }

        predicate()
    }

    /// Run the main loop on a separate thread until the returned handle is dropped
    pub fn spawn_loop(&self) -> LoopThread {
        let main_loop = self.main_loop.clone();
        let handle = thread::spawn(move || main_loop.run());

        LoopThread {
            main_loop: self.main_loop.clone(),
            handle: Some(handle),
        }
    }
}

pub struct LoopThread {
    main_loop: Arc<MainLoop>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        // `run` could have not started yet
        while let Some(handle) = self.handle.take() {
            self.main_loop.quit();
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                thread::sleep(Duration::from_millis(5));
                self.handle = Some(handle);
            }
        }
    }
}

#[fixture]
pub fn make_fixture() -> Fixture {
    Fixture::new(LevelFilter::Debug)
}

/// Reactor recording registrations without running anything
#[derive(Default)]
pub struct RecordingReactor {
    next: AtomicU64,
    active: Mutex<Vec<(SourceId, bool)>>,
}

impl RecordingReactor {
    /// Number of currently registered sources
    pub fn active(&self) -> usize {
        self.active.lock().len()
    }

    pub fn enabled(&self) -> usize {
        self.active.lock().iter().filter(|(_, e)| *e).count()
    }

    fn add(&self, enabled: bool) -> SourceId {
        let id = SourceId::new(self.next.fetch_add(1, Ordering::SeqCst));
        self.active.lock().push((id, enabled));
        id
    }
}

impl Reactor for RecordingReactor {
    fn insert(&self, _handler: Arc<dyn Handler>, enabled: bool) -> SourceId {
        self.add(enabled)
    }

    fn insert_timer(&self, _timer: Arc<dyn TimerHandler>, enabled: bool) -> SourceId {
        self.add(enabled)
    }

    fn set_enabled(&self, id: SourceId, enabled: bool) {
        if let Some(entry) = self.active.lock().iter_mut().find(|(i, _)| *i == id) {
            entry.1 = enabled;
        }
    }

    fn remove(&self, id: SourceId) {
        self.active.lock().retain(|(i, _)| *i != id);
    }
}

pub type CallHandler = dyn Fn(&RawMessage) -> Option<RawMessage> + Send + Sync;

/// Bus peer owning a well-known name and answering method calls on its own thread
pub struct MockService {
    connection: Arc<LoopbackConnection>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockService {
    pub fn start<F>(bus: &LoopbackBus, name: &str, handler: F) -> Self
    where
        F: Fn(&RawMessage) -> Option<RawMessage> + Send + Sync + 'static,
    {
        let connection = bus.connect().expect("Failed to connect mock service");
        connection
            .request_name(name)
            .expect("Failed to request service name");

        let handler: Arc<CallHandler> = Arc::new(handler);
        let weak = Arc::downgrade(&connection);
        connection.add_filter(Arc::new(move |message: &Arc<RawMessage>| {
            if message.kind != MessageKind::MethodCall {
                return FilterResult::NotYetHandled;
            }

            match (handler(message), weak.upgrade()) {
                (Some(reply), Some(connection)) => {
                    connection.send(&reply).expect("Failed to send reply");
                    FilterResult::Handled
                }
                _ => FilterResult::NotYetHandled,
            }
        }));

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_connection = connection.clone();

        let handle = thread::spawn(move || {
            while thread_running.load(Ordering::Acquire) {
                thread_connection.read_write(Duration::from_millis(20));
                while thread_connection.dispatch() == DispatchStatus::DataRemains {}
            }
        });

        Self {
            connection,
            running,
            handle: Some(handle),
        }
    }

    pub fn connection(&self) -> &Arc<LoopbackConnection> {
        &self.connection
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.connection.close();
    }
}
