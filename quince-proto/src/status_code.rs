use core::{
    fmt::{self, Display},
    num::NonZeroU16,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util;

/// Status code carried by the `NATS/1.0 <code>` header line
///
/// Always within `100..1000`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(NonZeroU16);

impl StatusCode {
    /// Idle heartbeat or flow control message of a JetStream consumer
    pub const IDLE_HEARTBEAT: Self = Self::constant(100);
    pub const OK: Self = Self::constant(200);
    /// The JetStream resource or message doesn't exist
    pub const NOT_FOUND: Self = Self::constant(404);
    /// A pull request expired before its batch was filled
    pub const TIMEOUT: Self = Self::constant(408);
    /// The pull request conflicts with the consumer state
    pub const CONFLICT: Self = Self::constant(409);
    /// Nobody is subscribed to the subject a request was sent to
    pub const NO_RESPONDERS: Self = Self::constant(503);

    const fn constant(code: u16) -> Self {
        assert!(code >= 100 && code < 1000);
        match NonZeroU16::new(code) {
            Some(code) => Self(code),
            None => panic!("status code is zero"),
        }
    }

    /// Parses exactly three ASCII digits
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` isn't a three digit status code.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, StatusCodeError> {
        if buf.len() != 3 {
            return Err(StatusCodeError);
        }
        let code = util::parse_u16(buf).map_err(|_| StatusCodeError)?;
        Self::try_from(code)
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = StatusCodeError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match NonZeroU16::new(code) {
            Some(code) if (100..1000).contains(&code.get()) => Ok(Self(code)),
            _ => Err(StatusCodeError),
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ascii_bytes(s.as_bytes())
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::try_from(u16::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// An error encountered while parsing a [`StatusCode`]
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
#[error("invalid status code")]
pub struct StatusCodeError;

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok_eq};

    use super::StatusCode;

    #[test]
    fn parse() {
        assert_ok_eq!(StatusCode::from_ascii_bytes(b"503"), StatusCode::NO_RESPONDERS);
        assert_ok_eq!("408".parse::<StatusCode>(), StatusCode::TIMEOUT);
        assert_err!(StatusCode::from_ascii_bytes(b"99"));
        assert_err!(StatusCode::from_ascii_bytes(b"1000"));
        assert_err!(StatusCode::from_ascii_bytes(b"0x1"));
        assert_err!(StatusCode::try_from(0));
        assert_err!(StatusCode::try_from(1000));
    }
}
