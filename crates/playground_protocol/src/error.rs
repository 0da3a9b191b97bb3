//! Error types for protocol value parsing.

use thiserror::Error;

/// Errors raised while parsing protocol values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Entity type other than `accounts` or `groups`
    #[error("Unknown entity type: {0}. Must be one of: accounts, groups")]
    UnknownEntityType(String),

    /// Blank entity name
    #[error("Entity name must not be empty")]
    EmptyEntityName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownEntityType("desks".to_string());
        assert!(err.to_string().contains("desks"));
        assert!(ProtocolError::EmptyEntityName
            .to_string()
            .contains("must not be empty"));
    }
}
