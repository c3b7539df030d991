use log::trace;
use tether_bus_common::Error;

use crate::{
    connection::Connection,
    message::{Arg, Message},
    native::Serial,
};

/// Outbound signal
/// ```
/// use tether_bus_lib::Signal;
///
/// let mut signal = Signal::new("com.example.signal.hello", "/com/example/signal").unwrap();
/// signal.push_back("world").unwrap();
///
/// assert_eq!(signal.message().interface(), Some("com.example.signal"));
/// assert_eq!(signal.message().member(), Some("hello"));
/// ```
#[derive(Debug, Clone)]
pub struct Signal {
    message: Message,
}

impl Signal {
    /// Signal `name` is a full name, `<interface>.<member>`
    pub fn new(name: &str, path: &str) -> crate::Result<Self> {
        let (interface, member) = name
            .rsplit_once('.')
            .filter(|(interface, member)| !interface.is_empty() && !member.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("Invalid signal name '{name}'")))?;

        Ok(Self {
            message: Message::signal(path, interface, member),
        })
    }

    pub fn push_back<A: Into<Arg>>(&mut self, arg: A) -> crate::Result<&mut Self> {
        self.message.push_back(arg)?;
        Ok(self)
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Broadcast the signal
    pub fn emit(&self, connection: &Connection) -> crate::Result<Serial> {
        trace!(
            "Emitting {}.{}",
            self.message.interface().unwrap_or_default(),
            self.message.member().unwrap_or_default()
        );

        connection.send(&self.message)
    }
}
