//! Cookie and protocol-version agreement between host and plugin.
//!
//! The host exports [`MAGIC_COOKIE_KEY`] and [`PROTOCOL_VERSION_KEY`] into the
//! plugin's environment. A plugin started without the cookie refuses to run; a
//! plugin that accepts it answers with a single handshake line before any
//! JSON-RPC traffic.

use crate::error::{PluginError, PluginResult};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "REORG_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "reorg-plugin-v1";
pub const PROTOCOL_VERSION_KEY: &str = "REORG_PLUGIN_PROTOCOL_VERSION";
pub const WIRE_PROTOCOL: &str = "jsonrpc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub cookie: String,
    pub protocol_version: u32,
    pub wire: String,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            cookie: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            wire: WIRE_PROTOCOL.to_string(),
        }
    }

    /// `cookie|version|wire`, without the trailing newline.
    pub fn line(&self) -> String {
        format!("{}|{}|{}", self.cookie, self.protocol_version, self.wire)
    }

    pub fn parse(line: &str) -> PluginResult<Self> {
        let mut parts = line.trim().split('|');
        let (Some(cookie), Some(version), Some(wire), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(PluginError::Handshake(format!("malformed handshake line {line:?}")));
        };
        let protocol_version = version
            .parse::<u32>()
            .map_err(|_| PluginError::Handshake(format!("invalid protocol version {version:?}")))?;
        Ok(Self {
            cookie: cookie.to_string(),
            protocol_version,
            wire: wire.to_string(),
        })
    }

    /// Host-side acceptance check on the line echoed by the plugin.
    pub fn verify(&self) -> PluginResult<()> {
        if self.cookie != MAGIC_COOKIE_VALUE {
            return Err(PluginError::Handshake("magic cookie mismatch".into()));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "protocol version mismatch: host {PROTOCOL_VERSION}, plugin {}",
                self.protocol_version
            )));
        }
        if self.wire != WIRE_PROTOCOL {
            return Err(PluginError::Handshake(format!("unsupported wire protocol {:?}", self.wire)));
        }
        Ok(())
    }
}

/// Plugin-side check of the environment the host is expected to provide.
pub fn check_environment(
    cookie: Option<String>,
    version: Option<String>,
) -> PluginResult<()> {
    if cookie.as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(PluginError::Handshake(
            "this binary is a reorg plugin and is not meant to be executed directly; \
             run it through `reorg plugin run <name>` or the daemon"
                .into(),
        ));
    }
    match version.as_deref().map(str::parse::<u32>) {
        Some(Ok(v)) if v == PROTOCOL_VERSION => Ok(()),
        Some(Ok(v)) => Err(PluginError::Handshake(format!(
            "protocol version mismatch: host {v}, plugin {PROTOCOL_VERSION}"
        ))),
        _ => Err(PluginError::Handshake("missing or invalid protocol version".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_handshake_verifies() {
        let line = Handshake::current().line();
        assert_eq!(line, "reorg-plugin-v1|1|jsonrpc");
        Handshake::parse(&line).unwrap().verify().unwrap();
    }

    #[test]
    fn mismatches_are_rejected() {
        let wrong_cookie = Handshake::parse("other-app|1|jsonrpc").unwrap();
        assert!(matches!(wrong_cookie.verify(), Err(PluginError::Handshake(_))));

        let wrong_version = Handshake::parse("reorg-plugin-v1|2|jsonrpc").unwrap();
        assert!(wrong_version.verify().is_err());

        assert!(Handshake::parse("hello world").is_err());
        assert!(Handshake::parse("reorg-plugin-v1|x|jsonrpc").is_err());
        assert!(Handshake::parse("a|1|b|c").is_err());
    }

    #[test]
    fn environment_requires_cookie_and_version() {
        assert!(check_environment(None, Some("1".into())).is_err());
        assert!(check_environment(Some("nope".into()), Some("1".into())).is_err());
        assert!(check_environment(Some(MAGIC_COOKIE_VALUE.into()), None).is_err());
        assert!(check_environment(Some(MAGIC_COOKIE_VALUE.into()), Some("7".into())).is_err());
        check_environment(Some(MAGIC_COOKIE_VALUE.into()), Some("1".into())).unwrap();
    }
}
