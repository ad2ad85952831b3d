//! Nominal identifier types for the LCM data model.
//!
//! Every entity id is a thin wrapper around `String` so that a `MessageId`
//! can never be passed where a `SummaryId` is expected, while still being
//! cheap to clone, hash, and bind as a SQL parameter.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! typed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Deterministic, conversation-scoped construction: `prefix + sha256(conversation_id
            /// + discriminator + now_ms)[..24]`. Two calls with the same inputs collide on
            /// purpose (idempotent re-ingest); different `discriminator`/`now_ms` never do in
            /// practice.
            pub fn derive(conversation_id: &str, discriminator: &str, now_ms: i64) -> Self {
                let mut hasher = Sha256::new();
                hasher.update(conversation_id.as_bytes());
                hasher.update(b"|");
                hasher.update(discriminator.as_bytes());
                hasher.update(b"|");
                hasher.update(now_ms.to_le_bytes());
                let digest = hasher.finalize();
                let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
                Self(format!("{}{}", $prefix, &hex[..24]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <String as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <String as sqlx::Encode<sqlx::Sqlite>>::encode(self.0.clone(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                <String as sqlx::Decode<sqlx::Sqlite>>::decode(value).map(Self)
            }
        }
    };
}

typed_id!(ConversationId, "conv_");
typed_id!(MessageId, "msg_");
typed_id!(PartId, "part_");
typed_id!(ItemId, "item_");
typed_id!(SummaryId, "sum_");
typed_id!(RunId, "run_");
typed_id!(ArtifactId, "art_");
typed_id!(GrantId, "grant_");

/// Lineage edge relation kind. Not a newtype over `String` like the ids
/// above because the set of relations is closed and exhaustively matched
/// throughout compaction and expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    Summarizes,
    Condenses,
    Derived,
}

impl EdgeRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeRelation::Summarizes => "summarizes",
            EdgeRelation::Condenses => "condenses",
            EdgeRelation::Derived => "derived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "summarizes" => Some(EdgeRelation::Summarizes),
            "condenses" => Some(EdgeRelation::Condenses),
            "derived" => Some(EdgeRelation::Derived),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = SummaryId::derive("conv-1", "leaf", 1_000);
        let b = SummaryId::derive("conv-1", "leaf", 1_000);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("sum_"));
    }

    #[test]
    fn derive_differs_on_discriminator() {
        let a = SummaryId::derive("conv-1", "leaf", 1_000);
        let b = SummaryId::derive("conv-1", "condensed", 1_000);
        assert_ne!(a, b);
    }

    #[test]
    fn edge_relation_round_trips() {
        for rel in [
            EdgeRelation::Summarizes,
            EdgeRelation::Condenses,
            EdgeRelation::Derived,
        ] {
            assert_eq!(EdgeRelation::parse(rel.as_str()), Some(rel));
        }
    }
}
