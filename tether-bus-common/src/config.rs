use std::{fs, path::Path};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Declarative interface subscription.
/// A configuration file is a JSON list of interfaces:
/// ```json
/// [
///     {
///         "dbus-interface": "org.gnome.ScreenSaver",
///         "members": [
///             { "dbus-member": "ActiveChanged" }
///         ]
///     }
/// ]
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    #[serde(rename = "dbus-interface")]
    pub interface: String,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemberConfig {
    #[serde(rename = "dbus-member")]
    pub member: String,
}

impl InterfaceConfig {
    /// Parse a list of interfaces from a JSON string
    pub fn parse(json: &str) -> Result<Vec<InterfaceConfig>> {
        let result: Vec<InterfaceConfig> =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;

        for interface in result.iter() {
            if interface.interface.is_empty() {
                return Err(Error::Config("empty interface name".into()));
            }

            if interface.members.iter().any(|m| m.member.is_empty()) {
                return Err(Error::Config(format!(
                    "empty member name in '{}'",
                    interface.interface
                )));
            }
        }

        Ok(result)
    }

    /// Read a list of interfaces from a JSON file
    pub fn load(path: &Path) -> Result<Vec<InterfaceConfig>> {
        debug!("Reading interface configuration from {path:?}");

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        Self::parse(&content)
    }
}
