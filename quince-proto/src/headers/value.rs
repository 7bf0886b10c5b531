validated_string! {
    /// The value of a message header
    ///
    /// Values are non-empty, at most 1024 bytes long and never contain
    /// `\r` or `\n`.
    pub struct HeaderValue;
    error = HeaderValueValidateError;
    validate = validate_header_value;
}

/// An error encountered while validating a [`HeaderValue`]
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderValueValidateError {
    #[error("header value is empty")]
    Empty,
    #[error("header value is too long")]
    TooLong,
    #[error("header value contains a line break")]
    IllegalCharacter,
}

fn validate_header_value(value: &str) -> Result<(), HeaderValueValidateError> {
    if value.is_empty() {
        Err(HeaderValueValidateError::Empty)
    } else if value.len() > 1024 {
        Err(HeaderValueValidateError::TooLong)
    } else if value.contains(['\r', '\n']) {
        Err(HeaderValueValidateError::IllegalCharacter)
    } else {
        Ok(())
    }
}
