//! Subscription identity.
//!
//! A feed is identified by an entity type (`accounts` or `groups`) and an
//! entity name (an account id or a group name). At most one subscription
//! per key is active in a subscriptions service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Kind of entity a position feed is keyed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A single trading account
    Accounts,
    /// A named group of accounts
    Groups,
}

impl EntityType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Accounts => "accounts",
            EntityType::Groups => "groups",
        }
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accounts" => Ok(EntityType::Accounts),
            "groups" => Ok(EntityType::Groups),
            _ => Err(ProtocolError::UnknownEntityType(s.to_string())),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a position feed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    /// Entity type
    pub entity_type: EntityType,
    /// Account id or group name
    pub entity_name: String,
}

impl SubscriptionKey {
    /// Create a key.
    pub fn new(entity_type: EntityType, entity_name: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_name: entity_name.into(),
        }
    }

    /// Parse a key from raw path segments, rejecting blank names.
    pub fn parse(entity_type: &str, entity_name: &str) -> Result<Self, ProtocolError> {
        let entity_type = EntityType::from_str(entity_type)?;
        if entity_name.trim().is_empty() {
            return Err(ProtocolError::EmptyEntityName);
        }
        Ok(Self::new(entity_type, entity_name))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_name)
    }
}
