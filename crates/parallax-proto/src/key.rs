//! Entity keys.
//!
//! Every first-class entity is identified by a 128-bit time-ordered ULID
//! rendered with a single-character kind prefix, e.g. `R01HXCQ...` for a
//! runner. The prefix makes keys self-describing in logs and rejects
//! cross-kind confusion at parse time.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Error produced when parsing a key from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("expected {expected} key prefix '{prefix}', got {got:?}")]
    WrongPrefix {
        expected: &'static str,
        prefix: char,
        got: String,
    },
    #[error("invalid ULID body in {kind} key: {0}", kind = .1)]
    InvalidUlid(ulid::DecodeError, &'static str),
}

macro_rules! entity_key {
    ($(#[$doc:meta])* $name:ident, $prefix:literal, $kind:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Ulid);

        impl $name {
            /// Generate a fresh time-ordered key.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let body = s.strip_prefix($prefix).ok_or_else(|| {
                    KeyParseError::WrongPrefix {
                        expected: $kind,
                        prefix: $prefix,
                        got: s.to_owned(),
                    }
                })?;
                let ulid = Ulid::from_string(body)
                    .map_err(|err| KeyParseError::InvalidUlid(err, $kind))?;
                Ok(Self(ulid))
            }
        }

        impl TryFrom<String> for $name {
            type Error = KeyParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> String {
                key.to_string()
            }
        }
    };
}

entity_key!(
    /// Identifies a runner for its whole lifetime.
    RunnerKey, 'R', "runner"
);
entity_key!(
    /// Identifies one immutable deployment of a module.
    DeploymentKey, 'D', "deployment"
);
entity_key!(
    /// Identifies a controller instance.
    ControllerKey, 'C', "controller"
);

/// Generate a deployment name for a module: the module name plus a random
/// 10-hex-digit suffix, e.g. `time-9f1c04aa3b`.
#[must_use]
pub fn deployment_name(module: &str) -> String {
    let suffix: u64 = rand::random::<u64>() & 0xff_ffff_ffff;
    format!("{module}-{suffix:010x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_prefix() {
        let key = RunnerKey::generate();
        let s = key.to_string();
        assert!(s.starts_with('R'));
        assert_eq!(s.parse::<RunnerKey>().unwrap(), key);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let key = DeploymentKey::generate().to_string();
        assert!(key.parse::<RunnerKey>().is_err());
        assert!("not-a-key".parse::<ControllerKey>().is_err());
    }

    #[test]
    fn keys_are_time_ordered() {
        let a = DeploymentKey::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = DeploymentKey::generate();
        assert!(a < b);
    }

    #[test]
    fn serde_uses_string_form() {
        let key = ControllerKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: ControllerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn deployment_names_have_hex_suffix() {
        let name = deployment_name("time");
        let (module, suffix) = name.rsplit_once('-').unwrap();
        assert_eq!(module, "time");
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
