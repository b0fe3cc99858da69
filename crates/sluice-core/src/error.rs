use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::SluiceError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            SluiceError::InvalidInput("empty peer id").to_string(),
            "invalid input: empty peer id"
        );
        assert_eq!(
            SluiceError::Decode("bad hex").to_string(),
            "decode error: bad hex"
        );
    }
}
