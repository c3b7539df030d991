//! Host event loop contract and the default poll based main loop.
//!
//! A [Reactor] watches descriptors and timers registered by [Handler] and [TimerHandler]
//! objects, calling them back when a descriptor becomes ready or a timer expires.
//! The watch and timeout bridge of a connection is just a set of such handlers, so any
//! host loop implementing the trait can drive a connection.

use std::{
    ops::{BitAnd, BitOr, BitOrAssign},
    os::fd::{AsRawFd, BorrowedFd},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use parking_lot::Mutex;

/// Readiness mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u8);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READABLE: Event = Event(0x01);
    pub const WRITABLE: Event = Event(0x02);
    pub const ERROR: Event = Event(0x04);
    pub const HANGUP: Event = Event(0x08);

    pub fn contains(&self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Self) -> Self::Output {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAnd for Event {
    type Output = Event;

    fn bitand(self, rhs: Self) -> Self::Output {
        Event(self.0 & rhs.0)
    }
}

impl From<Event> for PollFlags {
    fn from(event: Event) -> Self {
        let mut flags = PollFlags::empty();

        if event.contains(Event::READABLE) {
            flags |= PollFlags::POLLIN;
        }

        if event.contains(Event::WRITABLE) {
            flags |= PollFlags::POLLOUT;
        }

        // POLLHUP and POLLERR are always reported
        flags
    }
}

impl From<PollFlags> for Event {
    fn from(flags: PollFlags) -> Self {
        let mut event = Event::NONE;

        if flags.contains(PollFlags::POLLIN) {
            event |= Event::READABLE;
        }

        if flags.contains(PollFlags::POLLOUT) {
            event |= Event::WRITABLE;
        }

        if flags.contains(PollFlags::POLLERR) || flags.contains(PollFlags::POLLNVAL) {
            event |= Event::ERROR;
        }

        if flags.contains(PollFlags::POLLHUP) {
            event |= Event::HANGUP;
        }

        event
    }
}

/// Descriptor readiness handler
pub trait Handler: Send + Sync {
    /// Descriptor to watch, borrowed for one poll. Read on every loop iteration.
    /// A handler without a descriptor is skipped
    fn fd(&self) -> Option<BorrowedFd<'_>>;

    /// Events to watch for
    fn events(&self) -> Event;

    /// Descriptor is ready. Returning `false` removes the handler from the loop
    fn call(&self, events: Event) -> bool;
}

/// Timer handler
pub trait TimerHandler: Send + Sync {
    fn interval(&self) -> Duration;

    /// Timer expired. Returning `false` removes the timer from the loop
    fn call(&self) -> bool;
}

/// Registered source handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Host event loop
pub trait Reactor: Send + Sync {
    fn insert(&self, handler: Arc<dyn Handler>, enabled: bool) -> SourceId;

    fn insert_timer(&self, timer: Arc<dyn TimerHandler>, enabled: bool) -> SourceId;

    /// Enable or disable a source. Enabling a timer restarts its interval
    fn set_enabled(&self, id: SourceId, enabled: bool);

    fn remove(&self, id: SourceId);
}

struct HandlerEntry {
    id: SourceId,
    handler: Arc<dyn Handler>,
    enabled: bool,
}

struct TimerEntry {
    id: SourceId,
    timer: Arc<dyn TimerHandler>,
    enabled: bool,
    deadline: Instant,
}

#[derive(Default)]
struct Sources {
    handlers: Vec<HandlerEntry>,
    timers: Vec<TimerEntry>,
}

impl Sources {
    fn is_enabled(&self, id: SourceId) -> bool {
        self.handlers
            .iter()
            .any(|entry| entry.id == id && entry.enabled)
    }
}

/// Default [Reactor] implementation. Runs on the thread which calls [MainLoop::run]
pub struct MainLoop {
    sources: Mutex<Sources>,
    next_id: AtomicU64,
    running: AtomicBool,
}

static INSTANCE: OnceLock<Arc<MainLoop>> = OnceLock::new();

const MAX_LOOP_WAIT: Duration = Duration::from_millis(100);

/// One year
const MAX_TIMER_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl MainLoop {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Sources::default()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    /// Process-wide main loop. Created on first use and never destroyed
    pub fn instance() -> Arc<MainLoop> {
        INSTANCE
            .get_or_init(|| {
                debug!("Creating process main loop");
                Arc::new(MainLoop::new())
            })
            .clone()
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        let sources = self.sources.lock();
        sources.handlers.len() + sources.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run until [MainLoop::quit] is called
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        debug!("Main loop started");

        while self.running.load(Ordering::Acquire) {
            self.run_once(MAX_LOOP_WAIT);
        }

        debug!("Main loop stopped");
    }

    pub fn quit(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait at most `max_wait` for sources to become ready and call them.
    /// Returns number of called sources
    pub fn run_once(&self, max_wait: Duration) -> usize {
        let (watched, next_deadline) = {
            let sources = self.sources.lock();

            let watched: Vec<(SourceId, Arc<dyn Handler>)> = sources
                .handlers
                .iter()
                .filter(|entry| entry.enabled)
                .map(|entry| (entry.id, entry.handler.clone()))
                .collect();

            let next_deadline = sources
                .timers
                .iter()
                .filter(|entry| entry.enabled)
                .map(|entry| entry.deadline)
                .min();

            (watched, next_deadline)
        };

        let wait = match next_deadline {
            Some(deadline) => max_wait.min(deadline.saturating_duration_since(Instant::now())),
            None => max_wait,
        };

        let mut called = self.poll_handlers(&watched, wait);
        called += self.fire_timers();
        called
    }

    fn poll_handlers(&self, watched: &[(SourceId, Arc<dyn Handler>)], wait: Duration) -> usize {
        // Index into `watched`, descriptor and events
        let descriptors: Vec<(usize, BorrowedFd, Event)> = watched
            .iter()
            .enumerate()
            .filter_map(|(i, (_, handler))| Some((i, handler.fd()?, handler.events())))
            .collect();

        if descriptors.is_empty() {
            thread::sleep(wait);
            return 0;
        }

        let mut poll_fds: Vec<PollFd> = descriptors
            .iter()
            .map(|(_, fd, events)| PollFd::new(fd, PollFlags::from(*events)))
            .collect();

        let timeout = wait.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut poll_fds, timeout) {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(Errno::EINTR) => return 0,
            Err(e) => {
                warn!("Main loop poll failed: {e}");
                thread::sleep(wait);
                return 0;
            }
        }

        let ready: Vec<(usize, Event)> = poll_fds
            .iter()
            .zip(descriptors.iter())
            .filter_map(|(poll_fd, (i, _, _))| match poll_fd.revents() {
                Some(revents) if !revents.is_empty() => Some((*i, Event::from(revents))),
                _ => None,
            })
            .collect();
        drop(poll_fds);
        drop(descriptors);

        let mut called = 0;
        for (index, events) in ready {
            let (id, handler) = &watched[index];

            // A source could be disabled or removed by a previous callback
            if !self.sources.lock().is_enabled(*id) {
                continue;
            }

            called += 1;
            if !handler.call(events) {
                trace!("Handler {id:?} asked to be removed");
                self.remove(*id);
            }
        }

        called
    }

    fn fire_timers(&self) -> usize {
        let now = Instant::now();

        let expired: Vec<(SourceId, Arc<dyn TimerHandler>)> = {
            let mut sources = self.sources.lock();

            sources
                .timers
                .iter_mut()
                .filter(|entry| entry.enabled && entry.deadline <= now)
                .map(|entry| {
                    entry.deadline = deadline(now, entry.timer.as_ref());
                    (entry.id, entry.timer.clone())
                })
                .collect()
        };

        for (id, timer) in expired.iter() {
            if !timer.call() {
                trace!("Timer {id:?} asked to be removed");
                self.remove(*id);
            }
        }

        expired.len()
    }

    fn next_id(&self) -> SourceId {
        SourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Next expiry of `timer`. Intervals beyond the clock range are clamped to [MAX_TIMER_INTERVAL]
fn deadline(now: Instant, timer: &dyn TimerHandler) -> Instant {
    let interval = timer.interval();

    now.checked_add(interval).unwrap_or_else(|| {
        warn!("Timer interval {interval:?} is out of range");
        now + MAX_TIMER_INTERVAL
    })
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for MainLoop {
    fn insert(&self, handler: Arc<dyn Handler>, enabled: bool) -> SourceId {
        let id = self.next_id();
        trace!(
            "Adding handler {id:?} for descriptor {:?}",
            handler.fd().map(|fd| fd.as_raw_fd())
        );

        self.sources.lock().handlers.push(HandlerEntry {
            id,
            handler,
            enabled,
        });

        id
    }

    fn insert_timer(&self, timer: Arc<dyn TimerHandler>, enabled: bool) -> SourceId {
        let id = self.next_id();
        let deadline = deadline(Instant::now(), timer.as_ref());
        trace!("Adding timer {id:?} with interval {:?}", timer.interval());

        self.sources.lock().timers.push(TimerEntry {
            id,
            timer,
            enabled,
            deadline,
        });

        id
    }

    fn set_enabled(&self, id: SourceId, enabled: bool) {
        let mut sources = self.sources.lock();

        if let Some(entry) = sources.handlers.iter_mut().find(|entry| entry.id == id) {
            entry.enabled = enabled;
            return;
        }

        if let Some(entry) = sources.timers.iter_mut().find(|entry| entry.id == id) {
            if enabled && !entry.enabled {
                entry.deadline = deadline(Instant::now(), entry.timer.as_ref());
            }
            entry.enabled = enabled;
        }
    }

    fn remove(&self, id: SourceId) {
        let mut sources = self.sources.lock();

        sources.handlers.retain(|entry| entry.id != id);
        sources.timers.retain(|entry| entry.id != id);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::{fd::AsFd, unix::net::UnixStream},
        sync::atomic::AtomicUsize,
    };

    use super::*;

    struct Counter {
        socket: Option<UnixStream>,
        calls: AtomicUsize,
        keep: bool,
    }

    impl Counter {
        fn new(socket: Option<UnixStream>, keep: bool) -> Arc<Self> {
            Arc::new(Self {
                socket,
                calls: AtomicUsize::new(0),
                keep,
            })
        }
    }

    impl Handler for Counter {
        fn fd(&self) -> Option<BorrowedFd<'_>> {
            self.socket.as_ref().map(|socket| socket.as_fd())
        }

        fn events(&self) -> Event {
            Event::READABLE
        }

        fn call(&self, events: Event) -> bool {
            assert!(events.contains(Event::READABLE));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keep
        }
    }

    impl TimerHandler for Counter {
        fn interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn call(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keep
        }
    }

    #[test]
    fn test_readable_handler() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let main_loop = MainLoop::new();

        let handler = Counter::new(Some(reader), true);
        let id = main_loop.insert(handler.clone(), true);

        assert_eq!(main_loop.run_once(Duration::from_millis(5)), 0);

        writer.write_all(b"x").unwrap();
        assert_eq!(main_loop.run_once(Duration::from_millis(100)), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // Disabled handlers are not polled
        main_loop.set_enabled(id, false);
        assert_eq!(main_loop.run_once(Duration::from_millis(5)), 0);

        main_loop.remove(id);
        assert!(main_loop.is_empty());
    }

    #[test]
    fn test_handler_removal_on_false() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let main_loop = MainLoop::new();

        let handler = Counter::new(Some(reader), false);
        main_loop.insert(handler.clone(), true);

        writer.write_all(b"x").unwrap();
        main_loop.run_once(Duration::from_millis(100));
        assert!(main_loop.is_empty());
    }

    #[test]
    fn test_timers() {
        let main_loop = MainLoop::new();

        let timer = Counter::new(None, true);
        let id = main_loop.insert_timer(timer.clone(), false);

        main_loop.run_once(Duration::from_millis(5));
        assert_eq!(timer.calls.load(Ordering::SeqCst), 0);

        main_loop.set_enabled(id, true);
        main_loop.run_once(Duration::from_millis(20));
        assert!(timer.calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_handler_without_descriptor() {
        let main_loop = MainLoop::new();
        let handler = Counter::new(None, true);
        main_loop.insert(handler.clone(), true);

        assert_eq!(main_loop.run_once(Duration::from_millis(5)), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    struct Endless(AtomicUsize);

    impl TimerHandler for Endless {
        fn interval(&self) -> Duration {
            Duration::MAX
        }

        fn call(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_out_of_range_interval() {
        let main_loop = MainLoop::new();
        let timer = Arc::new(Endless(AtomicUsize::new(0)));

        let id = main_loop.insert_timer(timer.clone(), true);
        main_loop.set_enabled(id, false);
        main_loop.set_enabled(id, true);

        assert_eq!(main_loop.run_once(Duration::from_millis(5)), 0);
        assert_eq!(timer.0.load(Ordering::SeqCst), 0);
        assert_eq!(main_loop.len(), 1);

        // Expiry reschedules without overflowing
        main_loop.sources.lock().timers[0].deadline = Instant::now();
        assert_eq!(main_loop.run_once(Duration::from_millis(5)), 1);
        assert_eq!(timer.0.load(Ordering::SeqCst), 1);
        assert!(main_loop.sources.lock().timers[0].deadline > Instant::now());
    }
}
