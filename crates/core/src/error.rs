use crate::types::EntityId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed {entity} payload: {reason}")]
    MalformedPayload { entity: &'static str, reason: String },

    #[error("Payload for {entity} {expected} carried mismatched id {actual}")]
    IdMismatch {
        entity: &'static str,
        expected: EntityId,
        actual: EntityId,
    },

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub(crate) fn malformed(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            entity,
            reason: reason.into(),
        }
    }
}
