/// All platform primary keys are UUIDs.
pub type EntityId = uuid::Uuid;

/// Tenant boundary identifier. Every query and subscription is scoped by one.
pub type TenantId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
