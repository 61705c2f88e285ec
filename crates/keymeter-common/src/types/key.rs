//! Metered credentials ("keys") and their display forms

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mask::mask_credential;

/// A stored credential for the remote metering API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    /// Opaque identifier (`key-<8 hex>-<unix seconds>`)
    pub id: String,
    /// Secret credential sent as the bearer token
    pub key: String,
    /// Display name
    pub name: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Key {
    /// Create a key with a freshly generated identifier and default name
    pub fn new(credential: impl Into<String>) -> Self {
        let now = Utc::now();
        let id = generate_key_id(now);
        Self {
            name: format!("Key {}", id),
            id,
            key: credential.into(),
            created_at: now,
        }
    }

    /// Override the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Display form with the credential masked
    pub fn masked(&self) -> MaskedKey {
        MaskedKey {
            id: self.id.clone(),
            name: self.name.clone(),
            masked: mask_credential(&self.key),
            created_at: self.created_at,
        }
    }
}

/// A key as shown in listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskedKey {
    pub id: String,
    pub name: String,
    pub masked: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome counters for a batch import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: usize,
    pub failed: usize,
    pub duplicates: usize,
}

/// Outcome counters for a batch delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    pub success: usize,
    pub failed: usize,
}

fn generate_key_id(now: DateTime<Utc>) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("key-{}-{}", &uuid[..8], now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_format() {
        let key = Key::new("fk-abcdefghijklmnop");
        let parts: Vec<&str> = key.id.splitn(3, '-').collect();
        assert_eq!(parts[0], "key");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[2].parse::<i64>().is_ok());
        assert_eq!(key.name, format!("Key {}", key.id));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Key::new("same");
        let b = Key::new("same");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_masked_listing() {
        let key = Key::new("fk-1234567890abcd").with_name("primary");
        let masked = key.masked();
        assert_eq!(masked.masked, "fk-1...abcd");
        assert_eq!(masked.name, "primary");
        assert_eq!(masked.id, key.id);
    }
}
