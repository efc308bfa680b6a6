//! redb table definitions for the history store.

use redb::TableDefinition;

/// Update attempts keyed by `{target}:{attempt_id}`.
pub const ATTEMPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attempts");
