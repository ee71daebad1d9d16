/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use crate::error::AeronError;
use std::fmt;
use std::str::FromStr;

const URI_PREFIX: &str = "aeron:udp";

const KEY_ENDPOINT: &str = "endpoint";
const KEY_CONTROL: &str = "control";
const KEY_CONTROL_MODE: &str = "control-mode";
const KEY_SESSION_ID: &str = "session-id";
const KEY_TERM_LENGTH: &str = "term-length";

const CONTROL_MODE_DYNAMIC: &str = "dynamic";

/// A parsed `aeron:udp` channel address.
///
/// [`ChannelUri`] is a value type: all mutators consume `self` and return a
/// new value, so a base URI can be shared and specialized per session without
/// aliasing surprises. Equality and hashing are defined over the normalized
/// form, which means two URIs carrying the same keys in a different order
/// compare equal.
///
/// Recognized keys are `endpoint`, `control`, `control-mode` (only `dynamic`
/// is supported), `session-id` and `term-length`, `|`-separated after the
/// `aeron:udp?` prefix.
///
/// # Examples
///
/// ```
/// use aeron_duplex::ChannelUri;
///
/// let base = ChannelUri::udp()
///     .with_control("203.0.113.7:13001")
///     .with_dynamic_control_mode();
/// let session = base.clone().with_session_id(0x2a);
///
/// assert_eq!(
///     session.to_string(),
///     "aeron:udp?control=203.0.113.7:13001|control-mode=dynamic|session-id=42"
/// );
/// assert_eq!(session, session.to_string().parse().unwrap());
/// assert_ne!(base, session);
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ChannelUri {
    endpoint: Option<String>,
    control: Option<String>,
    dynamic_control_mode: bool,
    session_id: Option<i32>,
    term_length: Option<u64>,
}

impl ChannelUri {
    /// Creates an empty `aeron:udp` URI.
    pub fn udp() -> Self {
        Self::default()
    }

    /// Returns a copy with the unicast `endpoint` set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Returns a copy with the MDC `control` endpoint set.
    pub fn with_control(mut self, control: impl Into<String>) -> Self {
        self.control = Some(control.into());
        self
    }

    /// Returns a copy with `control-mode=dynamic` set.
    pub fn with_dynamic_control_mode(mut self) -> Self {
        self.dynamic_control_mode = true;
        self
    }

    /// Returns a copy qualified by `session-id`.
    pub fn with_session_id(mut self, session_id: i32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Returns a copy with the term buffer length hint set.
    pub fn with_term_length(mut self, term_length: u64) -> Self {
        self.term_length = Some(term_length);
        self
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    pub fn has_dynamic_control_mode(&self) -> bool {
        self.dynamic_control_mode
    }

    pub fn session_id(&self) -> Option<i32> {
        self.session_id
    }

    pub fn term_length(&self) -> Option<u64> {
        self.term_length
    }

    /// The address a publication directs traffic at: the control endpoint for
    /// MDC channels, the unicast endpoint otherwise.
    pub fn target_address(&self) -> Option<&str> {
        self.control.as_deref().or(self.endpoint.as_deref())
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_PREFIX}")?;
        let mut separator = '?';
        let mut put = |f: &mut fmt::Formatter<'_>, key: &str, value: &dyn fmt::Display| {
            let result = write!(f, "{separator}{key}={value}");
            separator = '|';
            result
        };
        if let Some(endpoint) = &self.endpoint {
            put(f, KEY_ENDPOINT, endpoint)?;
        }
        if let Some(control) = &self.control {
            put(f, KEY_CONTROL, control)?;
        }
        if self.dynamic_control_mode {
            put(f, KEY_CONTROL_MODE, &CONTROL_MODE_DYNAMIC)?;
        }
        if let Some(session_id) = &self.session_id {
            put(f, KEY_SESSION_ID, session_id)?;
        }
        if let Some(term_length) = &self.term_length {
            put(f, KEY_TERM_LENGTH, term_length)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelUri({self})")
    }
}

impl FromStr for ChannelUri {
    type Err = AeronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| AeronError::InvalidChannel(format!("not an {URI_PREFIX} URI: {s}")))?;

        let mut uri = ChannelUri::udp();
        if rest.is_empty() {
            return Ok(uri);
        }
        let params = rest.strip_prefix('?').ok_or_else(|| {
            AeronError::InvalidChannel(format!("expected '?' after {URI_PREFIX}: {s}"))
        })?;

        for param in params.split('|') {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                AeronError::InvalidChannel(format!("malformed parameter '{param}' in: {s}"))
            })?;
            match key {
                KEY_ENDPOINT => uri.endpoint = Some(value.to_string()),
                KEY_CONTROL => uri.control = Some(value.to_string()),
                KEY_CONTROL_MODE => {
                    if value != CONTROL_MODE_DYNAMIC {
                        return Err(AeronError::InvalidChannel(format!(
                            "unsupported control-mode '{value}' in: {s}"
                        )));
                    }
                    uri.dynamic_control_mode = true;
                }
                KEY_SESSION_ID => {
                    uri.session_id = Some(value.parse().map_err(|_| {
                        AeronError::InvalidChannel(format!("invalid session-id '{value}' in: {s}"))
                    })?);
                }
                KEY_TERM_LENGTH => {
                    uri.term_length = Some(value.parse().map_err(|_| {
                        AeronError::InvalidChannel(format!("invalid term-length '{value}' in: {s}"))
                    })?);
                }
                other => {
                    return Err(AeronError::InvalidChannel(format!(
                        "unrecognized parameter '{other}' in: {s}"
                    )));
                }
            }
        }
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelUri;
    use crate::error::AeronError;

    #[test]
    fn builds_canonical_string_in_fixed_key_order() {
        let uri = ChannelUri::udp()
            .with_term_length(65536)
            .with_session_id(7)
            .with_endpoint("127.0.0.1:13000");

        assert_eq!(
            uri.to_string(),
            "aeron:udp?endpoint=127.0.0.1:13000|session-id=7|term-length=65536"
        );
    }

    #[test]
    fn parse_accepts_any_key_order() {
        let left: ChannelUri = "aeron:udp?session-id=-5|endpoint=h:1|control=c:2"
            .parse()
            .unwrap();
        let right: ChannelUri = "aeron:udp?endpoint=h:1|control=c:2|session-id=-5"
            .parse()
            .unwrap();

        assert_eq!(left, right);
        assert_eq!(left.session_id(), Some(-5));
    }

    #[test]
    fn equality_is_by_normalized_form() {
        let built = ChannelUri::udp()
            .with_control("host:9010")
            .with_dynamic_control_mode()
            .with_session_id(3);
        let parsed: ChannelUri = "aeron:udp?control-mode=dynamic|session-id=3|control=host:9010"
            .parse()
            .unwrap();

        assert_eq!(built, parsed);
    }

    #[test]
    fn with_session_id_leaves_the_base_untouched() {
        let base = ChannelUri::udp().with_endpoint("host:9000");
        let qualified = base.clone().with_session_id(11);

        assert_eq!(base.session_id(), None);
        assert_eq!(qualified.session_id(), Some(11));
        assert_eq!(qualified.endpoint(), Some("host:9000"));
    }

    #[test]
    fn target_address_prefers_control_endpoint() {
        let mdc = ChannelUri::udp()
            .with_endpoint("local:0")
            .with_control("ctrl:9")
            .with_dynamic_control_mode();

        assert_eq!(mdc.target_address(), Some("ctrl:9"));
        assert_eq!(
            ChannelUri::udp().with_endpoint("e:1").target_address(),
            Some("e:1")
        );
    }

    #[test]
    fn rejects_foreign_media_and_unknown_keys() {
        assert!(matches!(
            "aeron:ipc".parse::<ChannelUri>(),
            Err(AeronError::InvalidChannel(_))
        ));
        assert!(matches!(
            "aeron:udp?mtu=1408".parse::<ChannelUri>(),
            Err(AeronError::InvalidChannel(_))
        ));
        assert!(matches!(
            "aeron:udp?control-mode=manual".parse::<ChannelUri>(),
            Err(AeronError::InvalidChannel(_))
        ));
    }
}
