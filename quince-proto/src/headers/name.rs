use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use unicase::UniCase;

/// The name of a message header
///
/// Comparisons between header names ignore ASCII case. Names are non-empty,
/// at most 64 bytes long and contain neither whitespace nor `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderName(UniCase<ByteString>);

impl HeaderName {
    /// Unique message id, used by JetStream to de-duplicate publishes
    pub const MESSAGE_ID: Self = Self::constant("Nats-Msg-Id");
    /// Makes JetStream reject the publish unless it lands in this stream
    pub const EXPECTED_STREAM: Self = Self::constant("Nats-Expected-Stream");
    /// Makes JetStream reject the publish unless the last sequence matches
    pub const EXPECTED_LAST_SEQUENCE: Self = Self::constant("Nats-Expected-Last-Sequence");
    /// Makes JetStream reject the publish unless the last sequence on the subject matches
    pub const EXPECTED_LAST_SUBJECT_SEQUENCE: Self =
        Self::constant("Nats-Expected-Last-Subject-Sequence");
    /// Purges previous messages of the subject (`sub`) or of the whole stream (`all`)
    pub const ROLLUP: Self = Self::constant("Nats-Rollup");
    /// Stream a message was read from
    pub const STREAM: Self = Self::constant("Nats-Stream");
    /// Original subject of a message read through the JetStream API
    pub const SUBJECT: Self = Self::constant("Nats-Subject");
    /// Stream sequence of a message read through the JetStream API
    pub const SEQUENCE: Self = Self::constant("Nats-Sequence");
    /// RFC3339 timestamp of a message read through the JetStream API
    pub const TIMESTAMP: Self = Self::constant("Nats-Time-Stamp");
    /// Operation carried by a Key-Value entry (`DEL` or `PURGE`)
    pub const KV_OPERATION: Self = Self::constant("KV-Operation");
    /// Reason attached to a status message
    pub const DESCRIPTION: Self = Self::constant("Description");

    /// Builds a `HeaderName` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` doesn't pass validation.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        match Self::try_from(ByteString::from_static(value)) {
            Ok(this) => this,
            Err(err) => panic!("invalid HeaderName {value:?}: {err}"),
        }
    }

    /// Builds a `HeaderName` without validating it
    ///
    /// Header names decoded from the server take this path.
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        debug_assert!(
            validate_header_name(&value).is_ok(),
            "HeaderName {value:?} is invalid"
        );
        Self(UniCase::new(value))
    }

    const fn constant(value: &'static str) -> Self {
        Self(UniCase::ascii(ByteString::from_static(value)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<ByteString> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_header_name(&value)?;
        Ok(Self(UniCase::new(value)))
    }
}

impl TryFrom<String> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(ByteString::from(value))
    }
}

impl TryFrom<&str> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(ByteString::from(value))
    }
}

impl AsRef<str> for HeaderName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for HeaderName {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

/// An error encountered while validating a [`HeaderName`]
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderNameValidateError {
    #[error("header name is empty")]
    Empty,
    #[error("header name is too long")]
    TooLong,
    #[error("header name contains whitespace or ':'")]
    IllegalCharacter,
}

fn validate_header_name(name: &str) -> Result<(), HeaderNameValidateError> {
    if name.is_empty() {
        Err(HeaderNameValidateError::Empty)
    } else if name.len() > 64 {
        Err(HeaderNameValidateError::TooLong)
    } else if name.chars().any(|c| c.is_whitespace() || c == ':') {
        Err(HeaderNameValidateError::IllegalCharacter)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_err_eq;

    use super::{HeaderName, HeaderNameValidateError};

    #[test]
    fn case_insensitive() {
        assert_eq!(HeaderName::MESSAGE_ID, HeaderName::from_static("nats-msg-id"));
        assert_ne!(HeaderName::MESSAGE_ID, HeaderName::STREAM);
    }

    #[test]
    fn rejects_separator() {
        assert_err_eq!(
            HeaderName::try_from("Bad:Name"),
            HeaderNameValidateError::IllegalCharacter
        );
    }
}
