// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named argument sets carried as JSON payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SdkError};
use crate::types::Payload;

/// Named values passed to workflows, activities and signals.
///
/// On the wire this is a JSON object in the message payload. An absent or
/// empty payload is an empty set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Map<String, Value>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Add any serializable value.
    pub fn insert_json<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<()> {
        self.0.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Deserialize the named value, `None` when absent.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(value) => Ok(Some(T::deserialize(value)?)),
        }
    }

    /// Deserialize the named value, failing when absent.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.get(name)?
            .ok_or_else(|| SdkError::Serialization(format!("missing argument '{}'", name)))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from any value that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SdkError::Serialization(format!(
                "arguments must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn to_payload(&self) -> Result<Payload> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Serialize a result value as a payload.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Payload> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a payload produced by [`to_payload`].
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_with_and_get() {
        let args = Args::new().with("reason", "late").with("attempt", 2);
        assert_eq!(args.get_str("reason"), Some("late"));
        assert_eq!(args.get::<u32>("attempt").unwrap(), Some(2));
        assert_eq!(args.get::<u32>("missing").unwrap(), None);
        assert!(args.require::<u32>("missing").is_err());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut args = Args::new();
        args.insert_json(
            "order",
            &Order {
                id: 7,
                sku: "A-1".into(),
            },
        )
        .unwrap();

        let back = Args::from_payload(&args.to_payload().unwrap()).unwrap();
        assert_eq!(back, args);
        assert_eq!(
            back.require::<Order>("order").unwrap(),
            Order {
                id: 7,
                sku: "A-1".into()
            }
        );
    }

    #[test]
    fn test_empty_payload_is_empty_args() {
        assert!(Args::from_payload(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_from_serialize_requires_object() {
        assert!(Args::from_serialize(&Order { id: 1, sku: "x".into() }).is_ok());
        assert!(Args::from_serialize(&42).is_err());
    }

    #[test]
    fn test_wrong_type_is_serialization_error() {
        let args = Args::new().with("n", "not a number");
        assert!(matches!(
            args.get::<u32>("n"),
            Err(SdkError::Serialization(_))
        ));
    }
}
