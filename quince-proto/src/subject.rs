validated_string! {
    /// A validated NATS subject
    ///
    /// A `Subject` is a `.` separated list of tokens. Validation guarantees
    /// that:
    ///
    /// * the subject is between 1 and 256 bytes long
    /// * it contains no whitespace
    /// * no token is empty
    /// * `*` and `>` only appear as whole tokens, and `>` only as the last one
    ///
    /// Subjects received from the server are not validated, see
    /// [`Subject::from_dangerous_value`].
    pub struct Subject;
    error = SubjectValidateError;
    validate = validate_subject;
}

const MAX_SUBJECT_LEN: usize = 256;

impl Subject {
    /// Iterates over the `.` separated tokens of the subject
    pub fn tokens(&self) -> impl Iterator<Item = &'_ str> {
        self.as_str().split('.')
    }

    /// Returns `true` if the subject contains a `*` or `>` token
    ///
    /// Wildcard subjects can be subscribed to, but not published to.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.tokens().any(|token| token == "*" || token == ">")
    }
}

/// An error encountered while validating a [`Subject`]
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubjectValidateError {
    #[error("subject is empty")]
    Empty,
    #[error("subject is longer than {MAX_SUBJECT_LEN} bytes")]
    TooLong,
    #[error("subject contains whitespace")]
    IllegalCharacter,
    #[error("subject contains an empty token")]
    BrokenToken,
    #[error("subject contains a misplaced wildcard")]
    BrokenWildcard,
}

fn validate_subject(subject: &str) -> Result<(), SubjectValidateError> {
    if subject.is_empty() {
        return Err(SubjectValidateError::Empty);
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(SubjectValidateError::TooLong);
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectValidateError::IllegalCharacter);
    }

    let token_count = subject.split('.').count();
    for (i, token) in subject.split('.').enumerate() {
        match token {
            "" => return Err(SubjectValidateError::BrokenToken),
            "*" => {}
            ">" if i + 1 == token_count => {}
            ">" => return Err(SubjectValidateError::BrokenWildcard),
            token if token.contains(['*', '>']) => {
                return Err(SubjectValidateError::BrokenWildcard)
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use claims::{assert_err_eq, assert_ok};

    use super::{Subject, SubjectValidateError};

    #[test]
    fn accepts_valid_subjects() {
        for subject in [
            "orders",
            "orders.created",
            "orders.*.created",
            "orders.*.*",
            "orders.>",
            ">",
            "_INBOX.abcdef.*",
        ] {
            let parsed = assert_ok!(Subject::try_from(subject));
            assert_eq!(subject, parsed.as_str());
        }
    }

    #[test]
    fn rejects_invalid_subjects() {
        let too_long = "a".repeat(257);
        let cases = [
            ("", SubjectValidateError::Empty),
            (too_long.as_str(), SubjectValidateError::TooLong),
            ("orders created", SubjectValidateError::IllegalCharacter),
            ("orders.created\r\n", SubjectValidateError::IllegalCharacter),
            ("\torders", SubjectValidateError::IllegalCharacter),
            ("orders..created", SubjectValidateError::BrokenToken),
            (".orders", SubjectValidateError::BrokenToken),
            ("orders.", SubjectValidateError::BrokenToken),
            ("orders.**", SubjectValidateError::BrokenWildcard),
            ("orders.a*", SubjectValidateError::BrokenWildcard),
            ("orders.>.created", SubjectValidateError::BrokenWildcard),
            ("orders.>a", SubjectValidateError::BrokenWildcard),
        ];
        for (subject, err) in cases {
            assert_err_eq!(Subject::try_from(subject), err);
        }
    }

    #[test]
    fn wildcard_detection() {
        assert!(Subject::from_static("orders.*").is_wildcard());
        assert!(Subject::from_static("orders.>").is_wildcard());
        assert!(!Subject::from_static("orders.created").is_wildcard());
    }

    #[test]
    fn deserialize_validates() {
        let subject: Subject = serde_json::from_str("\"a.b\"").unwrap();
        assert_eq!("a.b", subject.as_str());
        assert!(serde_json::from_str::<Subject>("\"a..b\"").is_err());
        let owned = Subject::try_from(String::from("a.b.c")).unwrap();
        assert_eq!(3, owned.tokens().count());
    }
}
