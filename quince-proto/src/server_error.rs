use bytestring::ByteString;

/// An error sent by the server through `-ERR`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("invalid subject")]
    InvalidSubject,
    #[error("permissions violation for publish: {raw_message}")]
    PublishPermissionViolation { raw_message: ByteString },
    #[error("permissions violation for subscription: {raw_message}")]
    SubscribePermissionViolation { raw_message: ByteString },
    #[error("unknown protocol operation")]
    UnknownProtocolOperation,
    #[error("attempted to connect to route port")]
    ConnectionAttemptedToWrongPort,
    #[error("authorization violation")]
    AuthorizationViolation,
    #[error("authorization timeout")]
    AuthorizationTimeout,
    #[error("invalid client protocol")]
    InvalidClientProtocol,
    #[error("maximum control line exceeded")]
    MaximumControlLineExceeded,
    #[error("parser error")]
    ParseError,
    #[error("secure connection, tls required")]
    TlsRequired,
    #[error("stale connection")]
    StaleConnection,
    #[error("maximum connections exceeded")]
    MaximumConnectionsExceeded,
    #[error("slow consumer")]
    SlowConsumer,
    #[error("maximum payload violation")]
    MaximumPayloadViolation,
    #[error("{raw_message}")]
    Other { raw_message: ByteString },
}

fn exact_match(message: &str) -> Option<ServerError> {
    let known = [
        ("Invalid Subject", ServerError::InvalidSubject),
        ("Unknown Protocol Operation", ServerError::UnknownProtocolOperation),
        (
            "Attempted To Connect To Route Port",
            ServerError::ConnectionAttemptedToWrongPort,
        ),
        ("Authorization Violation", ServerError::AuthorizationViolation),
        ("Authorization Timeout", ServerError::AuthorizationTimeout),
        ("Invalid Client Protocol", ServerError::InvalidClientProtocol),
        (
            "Maximum Control Line Exceeded",
            ServerError::MaximumControlLineExceeded,
        ),
        ("Parser Error", ServerError::ParseError),
        ("Secure Connection - TLS Required", ServerError::TlsRequired),
        ("Stale Connection", ServerError::StaleConnection),
        (
            "Maximum Connections Exceeded",
            ServerError::MaximumConnectionsExceeded,
        ),
        ("Slow Consumer", ServerError::SlowConsumer),
        ("Maximum Payload Violation", ServerError::MaximumPayloadViolation),
    ];
    known
        .into_iter()
        .find(|(text, _)| text.eq_ignore_ascii_case(message))
        .map(|(_, error)| error)
}

impl ServerError {
    /// Returns `true` if the server closes the connection after sending this error
    ///
    /// Permission and subject errors only affect the offending operation.
    /// Every other error, including unknown ones, ends the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidSubject
                | Self::PublishPermissionViolation { .. }
                | Self::SubscribePermissionViolation { .. }
        )
    }

    /// Classifies the text between the quotes of `-ERR '...'`
    #[must_use]
    pub fn parse(raw_message: ByteString) -> Self {
        let message = raw_message.trim();

        if let Some(error) = exact_match(message) {
            return error;
        }
        if starts_with_ignore_case(message, "Permissions Violation for Publish") {
            return Self::PublishPermissionViolation { raw_message };
        }
        if starts_with_ignore_case(message, "Permissions Violation for Subscription") {
            return Self::SubscribePermissionViolation { raw_message };
        }
        Self::Other { raw_message }
    }
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::ServerError;

    #[test]
    fn classify() {
        assert_eq!(
            ServerError::MaximumPayloadViolation,
            ServerError::parse(ByteString::from_static("maximum payload violation"))
        );
        let err = ServerError::parse(ByteString::from_static(
            "Permissions Violation for Subscription to \"secret.>\"",
        ));
        assert!(matches!(
            err,
            ServerError::SubscribePermissionViolation { .. }
        ));
        assert!(!err.is_fatal());
        assert_eq!(
            ServerError::Other {
                raw_message: ByteString::from_static("Something New")
            },
            ServerError::parse(ByteString::from_static("Something New"))
        );
    }

    #[test]
    fn fatality() {
        assert!(ServerError::StaleConnection.is_fatal());
        assert!(ServerError::AuthorizationViolation.is_fatal());
        assert!(!ServerError::InvalidSubject.is_fatal());
    }
}
