use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use log::{debug, error, trace};
use parking_lot::Mutex;
use tether_bus_common::WORKER_INTERFACE_PREFIX;

use crate::{
    interface::{Callback, Interface, MemberId},
    message::Message,
    native::{FilterResult, MessageKind, NativeConnection, RawMessage, Serial},
};

use super::GUARD;

/// Worker name of a worker interface. The prefix is matched case insensitively
pub(crate) fn worker_name(interface: &str) -> Option<&str> {
    let prefix = interface.get(..WORKER_INTERFACE_PREFIX.len())?;

    prefix
        .eq_ignore_ascii_case(WORKER_INTERFACE_PREFIX)
        .then(|| &interface[WORKER_INTERFACE_PREFIX.len()..])
}

pub(crate) type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

/// Connection state shared with the native message filter
pub(crate) struct Core {
    pub name: String,
    /// `None` after the connection is closed
    pub native: Mutex<Option<Arc<dyn NativeConnection>>>,
    pub interfaces: Mutex<Vec<Interface>>,
    /// Async calls waiting for replies
    pub replies: Mutex<HashMap<Serial, ReplyCallback>>,
}

impl Core {
    pub fn new(name: &str, native: Arc<dyn NativeConnection>) -> Self {
        Self {
            name: name.into(),
            native: Mutex::new(Some(native)),
            interfaces: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn native(&self) -> crate::Result<Arc<dyn NativeConnection>> {
        self.native.lock().clone().ok_or(crate::Error::Closed)
    }

    /// Message filter. Called by the native dispatch for every incoming message
    pub fn filter(&self, message: &Arc<RawMessage>) -> FilterResult {
        match message.kind {
            MessageKind::Signal => {
                self.on_signal(message);
                FilterResult::NotYetHandled
            }
            MessageKind::MethodReturn | MessageKind::Error => self.on_reply(message),
            MessageKind::MethodCall => {
                // Worker calls are only logged. Nothing answers them on this connection, so
                // the bus replies with an unknown method error
                if let Some(worker) = message.interface.as_deref().and_then(worker_name) {
                    debug!(
                        "{}: call of '{}' for worker '{worker}' is not routed",
                        self.name,
                        message.member.as_deref().unwrap_or_default()
                    );
                }

                FilterResult::NotYetHandled
            }
        }
    }

    fn on_reply(&self, message: &Arc<RawMessage>) -> FilterResult {
        let callback = message
            .reply_serial
            .and_then(|serial| self.replies.lock().remove(&serial));

        let Some(callback) = callback else {
            return FilterResult::NotYetHandled;
        };

        let reply = Message::from_raw(message.clone()).with_name(&self.name);
        if panic::catch_unwind(AssertUnwindSafe(move || callback(reply))).is_err() {
            error!("{}: reply callback panicked", self.name);
        }

        FilterResult::Handled
    }

    /// Call every member subscribed to the signal. Callback failures are logged
    pub fn on_signal(&self, message: &Arc<RawMessage>) {
        let (Some(interface), Some(member)) =
            (message.interface.as_deref(), message.member.as_deref())
        else {
            return;
        };

        let callbacks: Vec<Callback> = {
            let _guard = GUARD.lock();

            self.interfaces
                .lock()
                .iter()
                .filter(|i| **i == *interface)
                .flat_map(|i| i.matching(member))
                .map(|m| m.callback())
                .collect()
        };

        if callbacks.is_empty() {
            trace!("{}: no subscribers for {interface}.{member}", self.name);
            return;
        }

        trace!(
            "{}: {interface}.{member} to {} subscriber(s)",
            self.name,
            callbacks.len()
        );

        for callback in callbacks {
            let mut signal = Message::from_raw(message.clone()).with_name(&self.name);

            match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut signal))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("{}: {interface}.{member} callback failed: {err}", self.name)
                }
                Err(_) => error!("{}: {interface}.{member} callback panicked", self.name),
            }
        }
    }

    /// Remove a subscribed member, and the interface match rule with the last member.
    /// Returns `false` if the member is unknown
    pub fn unsubscribe(&self, member: MemberId) -> crate::Result<bool> {
        let _guard = GUARD.lock();

        let mut interfaces = self.interfaces.lock();
        let Some(index) = interfaces.iter().position(|i| i.contains(member)) else {
            return Ok(false);
        };

        interfaces[index].remove(member);
        let removed = interfaces[index].is_empty().then(|| interfaces.remove(index));
        drop(interfaces);

        if let Some(interface) = removed {
            self.remove_rule(&interface)?;
        }

        Ok(true)
    }

    pub fn remove_rule(&self, interface: &Interface) -> crate::Result<()> {
        self.native()?.remove_match(&interface.rule())?;

        debug!("{}: removed match rule {}", self.name, interface.rule());
        Ok(())
    }

    /// Fail all pending async calls
    pub fn drop_replies(&self) {
        let replies: Vec<ReplyCallback> = self.replies.lock().drain().map(|(_, c)| c).collect();

        for callback in replies {
            let reply = Message::no_reply("Connection closed").with_name(&self.name);

            if panic::catch_unwind(AssertUnwindSafe(move || callback(reply))).is_err() {
                error!("{}: reply callback panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_name() {
        assert_eq!(worker_name("br.eti.werneck.tether.Indexer"), Some("Indexer"));
        assert_eq!(worker_name("BR.ETI.Werneck.Tether.Indexer"), Some("Indexer"));
        assert_eq!(worker_name("br.eti.werneck.tether."), Some(""));
        assert_eq!(worker_name("br.eti.werneck.Indexer"), None);
        assert_eq!(worker_name("org.gnome.ScreenSaver"), None);
        assert_eq!(worker_name("br.eti"), None);
        // Multibyte character across the prefix boundary
        assert_eq!(worker_name("br.eti.werneck.tetheré"), None);
    }
}
