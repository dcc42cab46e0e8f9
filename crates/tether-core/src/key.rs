// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance keys: the identity that ties a conversation to a workflow instance.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Metadata entry marking a transient request/reply key.
pub const REQUEST_REPLY_CORRELATION: &str = "request-reply-correlation";

/// A typed metadata value carried by an [`InstanceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Identifier.
    Guid(Uuid),
    /// Free-form text.
    String(String),
}

impl From<&str> for InstanceValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for InstanceValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for InstanceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Identity used to look up the workflow instance that owns a conversation.
///
/// Two keys are equal when their identifiers are equal; metadata does not
/// take part in equality or hashing. Keys are immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceKey {
    id: Uuid,
    #[serde(default)]
    metadata: BTreeMap<String, InstanceValue>,
}

/// The distilled vocabulary calls these correlation keys.
pub type CorrelationKey = InstanceKey;

impl InstanceKey {
    /// Key with the given identifier and no metadata.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            metadata: BTreeMap::new(),
        }
    }

    /// Key with the given identifier and metadata.
    pub fn with_metadata(id: Uuid, metadata: BTreeMap<String, InstanceValue>) -> Self {
        Self { id, metadata }
    }

    /// The "no key" sentinel.
    pub fn invalid() -> Self {
        Self::new(Uuid::nil())
    }

    /// Fresh short-lived key linking a request to its reply.
    pub fn transient_request_reply() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            REQUEST_REPLY_CORRELATION.to_string(),
            InstanceValue::Bool(true),
        );
        Self::with_metadata(Uuid::new_v4(), metadata)
    }

    /// Derive a key from the values a correlation query selected.
    ///
    /// The identifier is the first 16 bytes of SHA-256 over the scope name
    /// and the sorted `name=value` pairs, so the same data in the same scope
    /// always yields the same key.
    pub fn from_key_data(scope: &str, data: &BTreeMap<String, String>) -> Result<Self> {
        if data.is_empty() {
            return Err(TetherError::InvalidInstanceKey(format!(
                "no key data selected for scope '{scope}'"
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update(b"|");
        for (name, value) in data {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b";");
        }
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);

        let metadata = data
            .iter()
            .map(|(k, v)| (k.clone(), InstanceValue::String(v.clone())))
            .collect();

        Ok(Self::with_metadata(Uuid::from_bytes(bytes), metadata))
    }

    /// Parse a remote-assigned instance identifier.
    pub fn parse(value: &str) -> Result<Self> {
        let id = Uuid::parse_str(value.trim()).map_err(|e| {
            TetherError::InvalidInstanceKey(format!("'{value}' is not an instance id: {e}"))
        })?;
        if id.is_nil() {
            return Err(TetherError::InvalidInstanceKey(
                "nil instance id".to_string(),
            ));
        }
        Ok(Self::new(id))
    }

    /// The key identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Metadata entries.
    pub fn metadata(&self) -> &BTreeMap<String, InstanceValue> {
        &self.metadata
    }

    /// Whether this is not the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
    }

    /// Whether this key was minted for request/reply correlation.
    pub fn is_request_reply(&self) -> bool {
        matches!(
            self.metadata.get(REQUEST_REPLY_CORRELATION),
            Some(InstanceValue::Bool(true))
        )
    }

    /// Copy of this key with extra metadata merged in (existing entries win).
    pub fn merged_with(&self, extra: &BTreeMap<String, InstanceValue>) -> Self {
        let mut metadata = self.metadata.clone();
        for (k, v) in extra {
            metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Self::with_metadata(self.id, metadata)
    }
}

impl PartialEq for InstanceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InstanceKey {}

impl Hash for InstanceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let id = Uuid::new_v4();
        let mut metadata = BTreeMap::new();
        metadata.insert("customer".to_string(), InstanceValue::from("c-1"));

        let a = InstanceKey::new(id);
        let b = InstanceKey::with_metadata(id, metadata);

        assert_eq!(a, b);
        assert_ne!(a, InstanceKey::new(Uuid::new_v4()));
    }

    #[test]
    fn test_key_data_is_deterministic() {
        let a = InstanceKey::from_key_data("orders", &data(&[("orderId", "42")])).unwrap();
        let b = InstanceKey::from_key_data("orders", &data(&[("orderId", "42")])).unwrap();
        let other_scope =
            InstanceKey::from_key_data("invoices", &data(&[("orderId", "42")])).unwrap();
        let other_value = InstanceKey::from_key_data("orders", &data(&[("orderId", "43")])).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other_scope);
        assert_ne!(a, other_value);
        assert_eq!(
            a.metadata().get("orderId"),
            Some(&InstanceValue::String("42".to_string()))
        );
    }

    #[test]
    fn test_empty_key_data_rejected() {
        let err = InstanceKey::from_key_data("orders", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INSTANCE_KEY");
    }

    #[test]
    fn test_transient_request_reply_key() {
        let a = InstanceKey::transient_request_reply();
        let b = InstanceKey::transient_request_reply();

        assert!(a.is_request_reply());
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert!(!InstanceKey::new(Uuid::new_v4()).is_request_reply());
    }

    #[test]
    fn test_parse() {
        let id = Uuid::new_v4();
        assert_eq!(InstanceKey::parse(&id.to_string()).unwrap().id(), id);
        assert!(InstanceKey::parse("not-a-guid").is_err());
        assert!(InstanceKey::parse(&Uuid::nil().to_string()).is_err());
        assert!(!InstanceKey::invalid().is_valid());
    }
}
