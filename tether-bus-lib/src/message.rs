use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use log::Level;
use tether_bus_common::{
    value::SliceCursor, ArgCursor, Error, FromValue, Result, Value, ERROR_NO_REPLY,
};

use crate::native::{MessageKind, RawMessage, Serial};

const DEFAULT_NAME: &str = "dbus";

/// Message argument. A closed set of types which can be appended to a message
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    String(String),
    /// Single array of strings argument
    Strings(Vec<String>),
    Value(Value),
}

macro_rules! arg_from {
    ($($source:ty => $variant:ident),*) => {
        $(
            impl From<$source> for Arg {
                fn from(value: $source) -> Self {
                    Arg::$variant(value)
                }
            }
        )*
    };
}

arg_from!(
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    String => String,
    Vec<String> => Strings,
    Value => Value
);

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::String(value.to_owned())
    }
}

impl From<&[&str]> for Arg {
    fn from(value: &[&str]) -> Self {
        Arg::Strings(value.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Arg> for Value {
    fn from(arg: Arg) -> Self {
        match arg {
            Arg::Bool(v) => Value::Boolean(v),
            Arg::Int16(v) => Value::Int16(v),
            Arg::UInt16(v) => Value::UInt16(v),
            Arg::Int32(v) => Value::Int32(v),
            Arg::UInt32(v) => Value::UInt32(v),
            Arg::Int64(v) => Value::Int64(v),
            Arg::UInt64(v) => Value::UInt64(v),
            Arg::String(v) => Value::String(v),
            Arg::Strings(v) => Value::strings(&v),
            Arg::Value(v) => v,
        }
    }
}

/// Bus message.
///
/// Outbound messages are built with one of the constructors and [Message::push_back].
/// Inbound messages are read in order with [Message::pop] and [Message::pop_as]:
/// ```
/// use tether_bus_lib::message::Message;
///
/// let mut message = Message::method_call(
///     "org.gnome.ScreenSaver",
///     "/org/gnome/ScreenSaver",
///     "org.gnome.ScreenSaver",
///     "SetActive",
/// );
/// message.push_back(true).unwrap();
///
/// assert!(message.is_ok());
/// assert_eq!(message.pop_as::<bool>(), Ok(true));
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    raw: Arc<RawMessage>,
    /// Read cursor position
    position: usize,
    /// Error name and text of an error message
    error: Option<(String, String)>,
    name: String,
}

impl Message {
    fn new(raw: RawMessage) -> Self {
        Self::from_raw(Arc::new(raw))
    }

    /// New method call
    pub fn method_call(destination: &str, path: &str, interface: &str, method: &str) -> Self {
        Self::new(RawMessage::method_call(destination, path, interface, method))
    }

    /// New method call with arguments, appended in order
    pub fn with_args(
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<Self> {
        let mut message = Self::method_call(destination, path, interface, method);

        for arg in args {
            message.push_back(arg)?;
        }

        Ok(message)
    }

    /// New signal
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self::new(RawMessage::signal(path, interface, member))
    }

    /// Wrap a native message. The message holds a reference to it for its lifetime
    pub fn from_raw(raw: Arc<RawMessage>) -> Self {
        let error = if raw.kind == MessageKind::Error {
            Some((
                raw.error_name.clone().unwrap_or_default(),
                raw.error_text().unwrap_or_default().to_owned(),
            ))
        } else {
            None
        };

        Self {
            raw,
            position: 0,
            error,
            name: DEFAULT_NAME.into(),
        }
    }

    /// Error message not bound to a call
    pub fn from_error(name: &str, text: &str) -> Self {
        Self::new(RawMessage::error(name, text))
    }

    /// Successful reply to `call`
    pub fn method_return(call: &Message) -> Self {
        Self::new(RawMessage::method_return(&call.raw))
    }

    /// Error reply to `call`
    pub fn error_reply(call: &Message, name: &str, text: &str) -> Self {
        Self::new(RawMessage::error_reply(&call.raw, name, text))
    }

    pub(crate) fn no_reply(text: &str) -> Self {
        Self::from_error(ERROR_NO_REPLY, text)
    }

    /// Set the logical name used as the log prefix
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn kind(&self) -> MessageKind {
        self.raw.kind
    }

    pub fn serial(&self) -> Serial {
        self.raw.serial
    }

    pub fn reply_serial(&self) -> Option<Serial> {
        self.raw.reply_serial
    }

    pub fn sender(&self) -> Option<&str> {
        self.raw.sender.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.raw.destination.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.raw.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.raw.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.raw.member.as_deref()
    }

    /// Don't expect a reply to this call
    pub fn set_no_reply(&mut self, no_reply: bool) {
        Arc::make_mut(&mut self.raw).no_reply = no_reply;
    }

    /// `true` if the message is a bus error
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// `true` unless the message is a bus error
    pub fn is_ok(&self) -> bool {
        !self.failed()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, text)| text.as_str())
    }

    /// Convert a failed message into [Error::Remote]
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some((name, message)) => Err(Error::Remote { name, message }),
            None => Ok(self),
        }
    }

    /// Append an argument
    pub fn push_back<A: Into<Arg>>(&mut self, arg: A) -> Result<&mut Self> {
        let value: Value = arg.into().into();

        value
            .validate()
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Arc::make_mut(&mut self.raw).args.push(value);
        Ok(self)
    }

    /// Read the argument at the cursor into `value` and advance.
    /// Returns `false` and leaves both untouched if there are no more arguments
    pub fn pop(&mut self, value: &mut Value) -> bool {
        let cursor = SliceCursor::at(&self.raw.args, self.position);

        if value.set(&cursor) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// Read the argument at the cursor as `T` and advance
    pub fn pop_as<T: FromValue>(&mut self) -> Result<T> {
        let mut value = Value::Boolean(false);

        if !self.pop(&mut value) {
            return Err(Error::EndOfArguments);
        }

        value.get()
    }

    /// Skip the argument at the cursor. Returns `true` if there is an argument at the
    /// new position
    pub fn next(&mut self) -> bool {
        let mut cursor = SliceCursor::at(&self.raw.args, self.position);
        let result = cursor.next();

        self.position = cursor.position();
        result
    }

    /// Arguments not read yet
    pub fn remaining(&self) -> &[Value] {
        self.raw.args.get(self.position..).unwrap_or_default()
    }

    /// All message arguments
    pub fn args(&self) -> &[Value] {
        &self.raw.args
    }

    pub fn info(&self) -> LogSink {
        LogSink::new(Level::Info, &self.name)
    }

    pub fn warning(&self) -> LogSink {
        LogSink::new(Level::Warn, &self.name)
    }

    pub fn error(&self) -> LogSink {
        LogSink::new(Level::Error, &self.name)
    }

    pub fn trace(&self) -> LogSink {
        LogSink::new(Level::Trace, &self.name)
    }
}

impl Display for Message {
    /// Remaining arguments, comma separated
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some((name, text)) = &self.error {
            return write!(f, "{name}: {text}");
        }

        for (index, value) in self.remaining().iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }

        Ok(())
    }
}

/// Line oriented log writer. Every complete line is logged with the message name prefix,
/// an incomplete tail is logged on drop
/// ```
/// use std::fmt::Write;
///
/// use tether_bus_lib::message::Message;
///
/// let message = Message::signal("/", "org.example", "Ping");
/// writeln!(message.info(), "Got {}", message.member().unwrap_or_default()).unwrap();
/// ```
pub struct LogSink {
    level: Level,
    prefix: String,
    line: String,
}

impl LogSink {
    fn new(level: Level, prefix: &str) -> Self {
        Self {
            level,
            prefix: prefix.into(),
            line: String::new(),
        }
    }

    fn emit(&mut self) {
        log::log!(self.level, "{}: {}", self.prefix, self.line);
        self.line.clear();
    }
}

impl fmt::Write for LogSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;

        while let Some((line, tail)) = rest.split_once('\n') {
            self.line.push_str(line);
            self.emit();
            rest = tail;
        }

        self.line.push_str(rest);
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            self.emit()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_in_order() {
        let mut message = Message::with_args(
            "org.example",
            "/org/example",
            "org.example",
            "Set",
            vec![
                Arg::from(true),
                Arg::from(-5i16),
                Arg::from(7u32),
                Arg::from("text"),
                Arg::from(vec!["a".to_owned(), "b".to_owned()]),
            ],
        )
        .unwrap();

        assert_eq!(message.args().len(), 5);
        assert_eq!(message.pop_as::<bool>(), Ok(true));
        assert_eq!(message.pop_as::<i16>(), Ok(-5));
        assert_eq!(message.pop_as::<u32>(), Ok(7));
        assert_eq!(message.pop_as::<String>(), Ok("text".to_owned()));
        assert_eq!(
            message.pop_as::<Vec<String>>(),
            Ok(vec!["a".to_owned(), "b".to_owned()])
        );
        assert_eq!(message.pop_as::<bool>(), Err(Error::EndOfArguments));
    }

    #[test]
    fn test_pop_at_end_keeps_value() {
        let mut message = Message::signal("/", "org.example", "Tick");
        message.push_back(1u16).unwrap();

        let mut value = Value::Boolean(false);
        assert!(message.pop(&mut value));
        assert_eq!(value, Value::UInt16(1));

        assert!(!message.pop(&mut value));
        assert_eq!(value, Value::UInt16(1));
        assert!(message.remaining().is_empty());
    }

    #[test]
    fn test_next_skips() {
        let mut message = Message::signal("/", "org.example", "Tick");
        message.push_back(1i32).unwrap().push_back("skip").unwrap();
        message.push_back(3u64).unwrap();

        assert!(message.next());
        assert!(message.next());
        assert_eq!(message.pop_as::<u64>(), Ok(3));
        assert!(!message.next());
    }

    #[test]
    fn test_type_mismatch() {
        let mut message = Message::signal("/", "org.example", "Tick");
        message.push_back("text").unwrap();

        assert!(matches!(
            message.pop_as::<u32>(),
            Err(Error::TypeMismatch { expected: "u32", .. })
        ));
    }

    #[test]
    fn test_serialization_error() {
        let mut message = Message::signal("/", "org.example", "Tick");
        let invalid = Value::ObjectPath("not a path".into());

        assert!(matches!(
            message.push_back(invalid),
            Err(Error::Serialization(_))
        ));
        assert!(message.args().is_empty());
    }

    #[test]
    fn test_error_message() {
        let message = Message::from_error("org.example.Error.Busy", "Try later");

        assert!(message.failed());
        assert!(!message.is_ok());
        assert_eq!(message.error_name(), Some("org.example.Error.Busy"));
        assert_eq!(message.error_message(), Some("Try later"));
        assert_eq!(message.to_string(), "org.example.Error.Busy: Try later");
        assert_eq!(
            message.into_result().unwrap_err(),
            Error::Remote {
                name: "org.example.Error.Busy".into(),
                message: "Try later".into()
            }
        );

        let ok = Message::signal("/", "org.example", "Tick");
        assert!(ok.is_ok());
        assert!(ok.error_name().is_none());
    }

    #[test]
    fn test_error_reply() {
        let call = Message::method_call("org.example", "/", "org.example", "Do");
        let reply = Message::error_reply(&call, "org.example.Error", "failed");

        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.reply_serial(), Some(call.serial()));
        assert!(reply.failed());
    }

    #[test]
    fn test_display() {
        let mut message = Message::signal("/", "org.example", "Tick").with_name("test");
        message.push_back(true).unwrap().push_back("a").unwrap();

        assert_eq!(message.name(), "test");
        assert_eq!(message.to_string(), format!("{}, {}", Value::Boolean(true), Value::from("a")));
        message.next();
        assert_eq!(message.to_string(), Value::from("a").to_string());
    }

    #[test]
    fn test_log_sink() {
        use std::fmt::Write;

        let message = Message::signal("/", "org.example", "Tick");
        let mut sink = message.trace();
        write!(sink, "first\nsecond").unwrap();
        assert_eq!(sink.line, "second");
    }
}
