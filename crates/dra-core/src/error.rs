//! Schema validation errors.
//!
//! Validation collects every problem it finds instead of stopping at the
//! first one, so a rejected write reports the complete list.

use std::fmt;

use thiserror::Error;

/// Result type alias for validation.
pub type ValidationResult = Result<(), ValidationErrors>;

/// A single schema violation, tagged with the path of the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: required value")]
    Required { field: String },

    #[error("{field}: must have at most {max} entries, got {actual}")]
    TooMany {
        field: String,
        max: usize,
        actual: usize,
    },

    #[error("{field}: must be no more than {max} bytes, got {actual}")]
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },

    #[error("{field}: invalid value {value:?}: {reason}")]
    Invalid {
        field: String,
        value: String,
        reason: String,
    },

    #[error("{field}: duplicate value {value:?}")]
    Duplicate { field: String, value: String },

    #[error("{field}: {reason}")]
    Forbidden { field: String, reason: String },
}

/// Every violation found while validating one object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub(crate) fn required(&mut self, field: impl Into<String>) {
        self.0.push(ValidationError::Required {
            field: field.into(),
        });
    }

    pub(crate) fn too_many(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.0.push(ValidationError::TooMany {
            field: field.into(),
            max,
            actual,
        });
    }

    pub(crate) fn too_long(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.0.push(ValidationError::TooLong {
            field: field.into(),
            max,
            actual,
        });
    }

    pub(crate) fn invalid(
        &mut self,
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.0.push(ValidationError::Invalid {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        });
    }

    pub(crate) fn duplicate(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.push(ValidationError::Duplicate {
            field: field.into(),
            value: value.into(),
        });
    }

    pub(crate) fn forbidden(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ValidationError::Forbidden {
            field: field.into(),
            reason: reason.into(),
        });
    }

    /// Check a list length against its ceiling.
    pub(crate) fn max_items(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        if actual > max {
            self.too_many(field, max, actual);
        }
    }

    pub(crate) fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub(crate) fn into_result(self) -> ValidationResult {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
            first = false;
        }
        Ok(())
    }
}

/// A mutually-exclusive field group was not populated with exactly one member.
///
/// Raised while decoding, so such documents never reach `validate()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("exactly one of {members} must be set, found {found}")]
pub struct OneOfError {
    pub members: &'static str,
    pub found: usize,
}
