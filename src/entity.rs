//! Entity identity: identifiers, entity types, and content-addressed cache ids.
//!
//! A mention becomes an entity through its [`CacheId`], a BLAKE3 digest over the
//! tenant, the normalized name, and the type. Two mentions of the same
//! real-world entity within a tenant always hash to the same cache id, which is
//! what makes deduplication independent of arrival order.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier from any string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
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

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Tenant that owns documents and entities. Entities never dedupe across tenants.
    TenantId
);
numeric_id!(
    /// Identifier assigned by the canonical index once an entity is persisted.
    PersistentId
);
numeric_id!(
    /// Node identifier assigned by the graph store.
    GraphId
);
numeric_id!(
    /// Datasource a document was ingested from.
    DatasourceId
);

string_id!(
    /// Identifies one ingestion batch (one delivery of one document).
    IngestionId
);
string_id!(
    /// Datasource-scoped identifier of a document's content.
    ContentId
);

/// Process-local identifier of a staging record.
///
/// Unlike [`CacheId`] this is random: two racing creations of the same entity
/// carry different tmp ids even though they share a cache id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TmpId(Uuid);

impl TmpId {
    /// Creates a new random tmp id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TmpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TmpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of entity types.
///
/// Parsed case-insensitively from the extractor's label. Labels outside the
/// built-in set are kept as `Custom` so they still dedupe among themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A human person
    Person,
    /// A company, institution, or group
    Organization,
    /// A geographic location
    Location,
    /// A temporal event
    Event,
    /// A product or artifact
    Product,
    /// An abstract concept or topic
    Concept,
    /// Any other extractor label (stored lowercased)
    Custom(String),
}

impl EntityType {
    /// Canonical label used for hashing and display.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Event => "event",
            Self::Product => "product",
            Self::Concept => "concept",
            Self::Custom(label) => label,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityType {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_lowercase();
        let parsed = match label.as_str() {
            "" => return Err(crate::error::ValidationError::EmptyEntityType),
            "person" | "per" => Self::Person,
            "organization" | "organisation" | "org" => Self::Organization,
            "location" | "loc" | "gpe" => Self::Location,
            "event" => Self::Event,
            "product" => Self::Product,
            "concept" => Self::Concept,
            _ => Self::Custom(label),
        };
        Ok(parsed)
    }
}

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex is valid"))
}

/// Normalizes an entity name for deduplication.
///
/// Trims, collapses whitespace runs to a single space, and lowercases.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    whitespace().replace_all(name.trim(), " ").to_lowercase()
}

const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Content-addressed identifier of an entity within a tenant.
///
/// The digest covers `(tenant, normalize(name), type)` and nothing else.
/// Serialized as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId([u8; 32]);

impl CacheId {
    /// Computes the cache id for a mention.
    #[must_use]
    pub fn compute(tenant_id: TenantId, name: &str, entity_type: &EntityType) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&tenant_id.get().to_le_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(normalize_name(name).as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(entity_type.label().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns the raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex digits are plenty to tell ids apart in logs.
        write!(f, "CacheId({})", &self.to_hex()[..12])
    }
}

impl FromStr for CacheId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for CacheId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Alice \t  Liddell\n"), "alice liddell");
        assert_eq!(normalize_name("ÉCOLE"), "école");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn entity_type_parses_aliases() {
        assert_eq!("PERSON".parse::<EntityType>().unwrap(), EntityType::Person);
        assert_eq!("per".parse::<EntityType>().unwrap(), EntityType::Person);
        assert_eq!("GPE".parse::<EntityType>().unwrap(), EntityType::Location);
        assert_eq!(
            "Vessel".parse::<EntityType>().unwrap(),
            EntityType::Custom("vessel".to_string())
        );
        assert!(" ".parse::<EntityType>().is_err());
    }

    #[test]
    fn cache_id_ignores_surface_variation() {
        let a = CacheId::compute(TenantId(1), "Alice", &EntityType::Person);
        let b = CacheId::compute(TenantId(1), "  alice ", &EntityType::Person);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_id_separates_tenant_and_type() {
        let base = CacheId::compute(TenantId(1), "Mercury", &EntityType::Concept);
        assert_ne!(base, CacheId::compute(TenantId(2), "Mercury", &EntityType::Concept));
        assert_ne!(base, CacheId::compute(TenantId(1), "Mercury", &EntityType::Location));
    }

    #[test]
    fn cache_id_hex_parses_back() {
        let id = CacheId::compute(TenantId(9), "Acme", &EntityType::Organization);
        let parsed: CacheId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 64);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        assert_eq!(serde_json::from_str::<CacheId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<CacheId>("\"zz\"").is_err());
    }
}
