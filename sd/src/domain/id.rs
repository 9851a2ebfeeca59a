//! Record id generation

use uuid::Uuid;

/// Generate a record id of the form `{prefix}-{uuidv7}`
///
/// UUIDv7 keeps ids roughly time-ordered, which makes the record tables
/// easier to eyeball when debugging a cycle.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}
