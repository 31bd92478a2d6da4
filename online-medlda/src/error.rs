//! Error taxonomy for the online MedLDA engine.
//!
//! Functions return `anyhow::Result`; the variants below travel inside
//! the `anyhow::Error` so callers can tell a bad batch from a broken
//! posterior with `err.downcast_ref::<MedLdaError>()`.

use std::fmt;

/// Failure classes of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MedLdaError {
    /// The posterior stopped being a valid distribution: a covariance
    /// lost positive definiteness, a count went negative, an inverse
    /// Gaussian parameter was non-positive, a normalizer was zero.
    /// Fatal to the round that hit it.
    Numerical {
        /// What went wrong
        what: String,
    },

    /// The caller used the engine out of order, e.g. ejected a round
    /// that is not alive or trained before `init()`.
    Protocol {
        /// What went wrong
        what: String,
    },

    /// Input data is inconsistent with the model: label count differs
    /// from document count, a word id is outside the vocabulary, a label
    /// is not usable for the configured classifier.
    Data {
        /// What went wrong
        what: String,
    },

    /// A sparse update list grew past its configured capacity.
    Capacity {
        /// The configured limit
        limit: usize,
    },

    /// An option is outside its domain.
    InvalidOption {
        /// Option name
        name: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },
}

impl MedLdaError {
    /// Shorthand for [`MedLdaError::Numerical`] as an `anyhow::Error`.
    pub fn numerical(what: impl Into<String>) -> anyhow::Error {
        MedLdaError::Numerical { what: what.into() }.into()
    }

    /// Shorthand for [`MedLdaError::Protocol`] as an `anyhow::Error`.
    pub fn protocol(what: impl Into<String>) -> anyhow::Error {
        MedLdaError::Protocol { what: what.into() }.into()
    }

    /// Shorthand for [`MedLdaError::Data`] as an `anyhow::Error`.
    pub fn data(what: impl Into<String>) -> anyhow::Error {
        MedLdaError::Data { what: what.into() }.into()
    }

    /// Shorthand for [`MedLdaError::InvalidOption`] as an `anyhow::Error`.
    pub fn invalid_option(
        name: &str,
        value: impl fmt::Display,
        constraint: &str,
    ) -> anyhow::Error {
        MedLdaError::InvalidOption {
            name: name.to_string(),
            value: value.to_string(),
            constraint: constraint.to_string(),
        }
        .into()
    }
}

impl fmt::Display for MedLdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MedLdaError::Numerical { what } => write!(f, "numerical failure: {}", what),
            MedLdaError::Protocol { what } => write!(f, "protocol violation: {}", what),
            MedLdaError::Data { what } => write!(f, "inconsistent data: {}", what),
            MedLdaError::Capacity { limit } => {
                write!(f, "sparse update list exceeded its capacity of {} cells", limit)
            }
            MedLdaError::InvalidOption {
                name,
                value,
                constraint,
            } => write!(f, "invalid option {}={} (expected {})", name, value, constraint),
        }
    }
}

impl std::error::Error for MedLdaError {}

/// The `MedLdaError` inside an `anyhow::Error`, if there is one.
pub fn kind_of(err: &anyhow::Error) -> Option<&MedLdaError> {
    err.downcast_ref::<MedLdaError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err = MedLdaError::protocol("round 3 is not alive");
        assert!(matches!(kind_of(&err), Some(MedLdaError::Protocol { .. })));
        assert!(err.to_string().contains("round 3"));
    }

    #[test]
    fn test_context_keeps_kind() {
        let err: anyhow::Error = MedLdaError::data("label mismatch");
        let err = err.context("training round 4");
        assert!(matches!(kind_of(&err), Some(MedLdaError::Data { .. })));
    }

    #[test]
    fn test_capacity_message() {
        let err = MedLdaError::Capacity { limit: 16 };
        assert!(err.to_string().contains("16"));
    }
}
