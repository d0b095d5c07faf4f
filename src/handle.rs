//! Correlation-id newtypes.
//!
//! Every id that crosses a component boundary (a session, an upstream
//! response) gets its own type instead of a bare `Uuid` so the compiler
//! catches a session id handed to a function expecting a response id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! handle_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// First 8 hex chars, for log lines.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(h: $name) -> Self {
                h.0
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

handle_type!(SessionId);
handle_type!(ResponseId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_is_eight_hex_chars() {
        let id = SessionId::new();
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn roundtrips_through_string() {
        let id = ResponseId::new();
        let parsed: ResponseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_and_response_ids_are_distinct_types() {
        let raw = Uuid::new_v4();
        let session = SessionId::from_uuid(raw);
        let response = ResponseId::from_uuid(raw);
        assert_eq!(session.as_uuid(), response.as_uuid());
    }
}
