use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(ActivityId);
id_newtype!(
    /// Address of a conversation's key material inside the KMS.
    KeyUri
);
id_newtype!(
    /// Storage location used for encrypted file shares in a conversation.
    SpaceUri
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityVerb {
    Post,
    Share,
    Delete,
    Acknowledge,
}

impl ActivityVerb {
    pub fn carries_content(self) -> bool {
        matches!(self, Self::Post | Self::Share)
    }
}

/// Whether the content fields of an activity currently hold plaintext or
/// ciphertext. The same struct travels in both directions, so the tag keeps a
/// transform from being applied twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentState {
    #[default]
    Plain,
    Cipher,
}

/// Capability level a conversation currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Readiness {
    NotReady,
    PostOnly,
    PostAndShare,
}

impl Readiness {
    pub fn satisfies(self, required: Readiness) -> bool {
        self >= required
    }
}

/// Lifecycle of a conversation's symmetric key. `KeyAvailable` is terminal for
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Unknown,
    LocationKnown,
    KeyRequested,
    KeyAvailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_levels_are_ordered() {
        assert!(Readiness::PostAndShare.satisfies(Readiness::PostOnly));
        assert!(Readiness::PostOnly.satisfies(Readiness::PostOnly));
        assert!(!Readiness::PostOnly.satisfies(Readiness::PostAndShare));
        assert!(!Readiness::NotReady.satisfies(Readiness::PostOnly));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ConversationId::new("R1");
        assert_eq!(serde_json::to_string(&id).expect("json"), "\"R1\"");
        let back: KeyUri = serde_json::from_str("\"kms://L1\"").expect("parse");
        assert_eq!(back.as_str(), "kms://L1");
    }

    #[test]
    fn documented_ids_behave_like_the_rest() {
        let space = SpaceUri::from("https://files/spaces/R1");
        assert_eq!(space.to_string(), "https://files/spaces/R1");
        assert_eq!(serde_json::to_value(&space).expect("json"), "https://files/spaces/R1");
        assert!(KeyUri::new("kms://a") < KeyUri::new("kms://b"));
    }
}
