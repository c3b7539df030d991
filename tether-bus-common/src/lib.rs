//! ## Tether bus common
//!
//! Types shared by the Tether D-Bus integration crates:
//! - [value::Value], the tagged wire value read from and written to message argument lists;
//! - [Error], the error taxonomy of the library;
//! - [config], declarative interface subscriptions;
//! - protocol constants.

pub mod config;
pub mod errors;
pub mod value;

pub use errors::{Error, Result};
pub use value::{ArgCursor, ArgType, FromValue, Value};

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Interface prefix of method calls serviced by internal workers
pub const WORKER_INTERFACE_PREFIX: &str = "br.eti.werneck.tether.";

pub const SESSION_BUS_ADDRESS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const STARTER_ADDRESS_ENV: &str = "DBUS_STARTER_ADDRESS";

/// Default method call reply timeout
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 25_000;

/// Signal match rule type tag
pub const SIGNAL_RULE_TYPE: &str = "signal";

/// Make a bus match rule for all messages of `kind` on `interface`
pub fn match_rule(kind: &str, interface: &str) -> String {
    format!("type='{kind}',interface='{interface}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_rule() {
        assert_eq!(
            match_rule(SIGNAL_RULE_TYPE, "org.example.Foo"),
            "type='signal',interface='org.example.Foo'"
        );
    }

    #[test]
    fn test_error_names() {
        assert_eq!(Error::NoReply.dbus_name(), ERROR_NO_REPLY);
        assert_eq!(Error::Closed.dbus_name(), ERROR_FAILED);

        let remote = Error::Remote {
            name: "org.example.Error.Busy".into(),
            message: "busy".into(),
        };
        assert_eq!(remote.dbus_name(), "org.example.Error.Busy");
        assert_eq!(remote.to_string(), "org.example.Error.Busy: busy");
    }
}
