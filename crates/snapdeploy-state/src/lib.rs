//! Persistent history of update attempts.
//!
//! Backed by [redb](https://docs.rs/redb). Each [`UpdateAttempt`] is
//! JSON-serialized into a `&[u8]` value column under the composite key
//! `{target}:{attempt_id}`. Attempt ids are timestamp keys, so a prefix
//! scan returns one target's history in chronological order.
//!
//! [`UpdateAttempt`]: snapdeploy_core::UpdateAttempt

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
