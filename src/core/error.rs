use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad caller input: unknown reserve or mint, position limit exceeded,
    /// missing leg of a two-legged action, invalid action for the obligation shape.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The snapshot does not contain what the operation needs
    /// (obligation not found, no slot to modify).
    #[error("State error: {0}")]
    State(String),

    /// Scaled fraction out of representable range.
    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn arithmetic(msg: impl Into<String>) -> Self {
        Error::Arithmetic(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_category() {
        let err = Error::validation("position limit exceeded");
        assert_eq!(err.to_string(), "Validation error: position limit exceeded");

        let err = Error::arithmetic("overflow");
        assert_eq!(err.to_string(), "Arithmetic error: overflow");
    }

    #[test]
    fn test_error_survives_anyhow_round_trip() {
        let wrapped: anyhow::Error = Error::state("missing borrow").into();
        let back = wrapped.downcast_ref::<Error>();
        assert_eq!(back, Some(&Error::State("missing borrow".to_string())));
    }
}
