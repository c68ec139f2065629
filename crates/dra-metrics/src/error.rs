//! Registry error types.

use thiserror::Error;

use crate::registry::Identifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Another observer already uses this name and resource. The returned
    /// identifier is usable but not unique, so its metrics stay unpublished.
    #[error("identifier {identifier} is not unique, metrics will not be published for it")]
    NotUnique { identifier: Identifier },
}
