validated_string! {
    /// Name of a queue group
    ///
    /// Subscribers sharing a queue group on the same subject split the
    /// messages between themselves. The name must be non-empty, at most 64
    /// bytes long and contain no whitespace.
    pub struct QueueGroup;
    error = QueueGroupValidateError;
    validate = validate_queue_group;
}

/// An error encountered while validating a [`QueueGroup`]
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueGroupValidateError {
    #[error("queue group is empty")]
    Empty,
    #[error("queue group is too long")]
    TooLong,
    #[error("queue group contains whitespace")]
    IllegalCharacter,
}

fn validate_queue_group(queue_group: &str) -> Result<(), QueueGroupValidateError> {
    if queue_group.is_empty() {
        Err(QueueGroupValidateError::Empty)
    } else if queue_group.len() > 64 {
        Err(QueueGroupValidateError::TooLong)
    } else if queue_group.chars().any(char::is_whitespace) {
        Err(QueueGroupValidateError::IllegalCharacter)
    } else {
        Ok(())
    }
}
