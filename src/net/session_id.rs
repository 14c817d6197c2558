//! Composite session identity
//!
//! A [`SessionId`] names one TCP session as `namespace:token:id`. Downstream
//! services treat the serialised form as an opaque correlation key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    namespace: String,
    token: String,
    id: u64,
}

impl SessionId {
    /// Build a session id. Namespace and token must be non-empty, and the
    /// namespace may not contain `:`.
    pub fn new(
        namespace: impl Into<String>,
        token: impl Into<String>,
        id: u64,
    ) -> Result<Self, SessionError> {
        let namespace = namespace.into();
        let token = token.into();

        if namespace.is_empty() {
            return Err(SessionError::InvalidSessionId("empty namespace".into()));
        }
        if namespace.contains(':') {
            return Err(SessionError::InvalidSessionId(format!(
                "namespace contains ':': {}",
                namespace
            )));
        }
        if token.is_empty() {
            return Err(SessionError::InvalidSessionId("empty token".into()));
        }

        Ok(Self {
            namespace,
            token,
            id,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.token, self.id)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    /// Splits on the first and last `:`, so tokens containing `:` survive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidSessionId(s.to_string());

        let (namespace, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (token, id) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let id = id.parse::<u64>().map_err(|_| invalid())?;

        SessionId::new(namespace, token, id)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let sid = SessionId::new("beehive", "u1", 42).unwrap();
        assert_eq!(sid.to_string(), "beehive:u1:42");

        let parsed: SessionId = "beehive:u1:42".parse().unwrap();
        assert_eq!(parsed, sid);
        assert_eq!(parsed.namespace(), "beehive");
        assert_eq!(parsed.token(), "u1");
        assert_eq!(parsed.id(), 42);
    }

    #[test]
    fn test_token_with_colons() {
        let sid = SessionId::new("edge", "a:b:c", 7).unwrap();
        let parsed: SessionId = sid.to_string().parse().unwrap();
        assert_eq!(parsed.token(), "a:b:c");
        assert_eq!(parsed, sid);
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(SessionId::new("", "u1", 1).is_err());
        assert!(SessionId::new("ns", "", 1).is_err());
        assert!(SessionId::new("n:s", "u1", 1).is_err());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "ns", "ns:u1", "ns:u1:x", ":u1:1", "ns::1", "ns:u1:-1"] {
            let result: Result<SessionId, _> = bad.parse();
            assert!(
                matches!(result, Err(SessionError::InvalidSessionId(_))),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        let sid = SessionId::new("beehive", "u2", 9).unwrap();
        let json = serde_json::to_string(&sid).unwrap();
        assert_eq!(json, "\"beehive:u2:9\"");

        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sid);
    }
}
