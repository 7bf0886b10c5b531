/// An error encountered while parsing an ASCII decimal number
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseUintError {
    #[error("number is empty")]
    Empty,
    #[error("invalid byte {0:?}")]
    InvalidByte(u8),
    #[error("number overflows")]
    Overflow,
}

pub(crate) fn parse_u64(buf: &[u8]) -> Result<u64, ParseUintError> {
    if buf.is_empty() {
        return Err(ParseUintError::Empty);
    }

    buf.iter().try_fold(0u64, |acc, &b| {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            _ => return Err(ParseUintError::InvalidByte(b)),
        };
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(digit))
            .ok_or(ParseUintError::Overflow)
    })
}

pub(crate) fn parse_u16(buf: &[u8]) -> Result<u16, ParseUintError> {
    parse_u64(buf).and_then(|n| u16::try_from(n).map_err(|_| ParseUintError::Overflow))
}

pub(crate) fn parse_usize(buf: &[u8]) -> Result<usize, ParseUintError> {
    parse_u64(buf).and_then(|n| usize::try_from(n).map_err(|_| ParseUintError::Overflow))
}
