use core::fmt::{self, Display};

use crate::util::{self, ParseUintError};

/// Client assigned identifier of a subscription (the `sid` of `SUB`)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const MIN: Self = Self(1);
    pub const MAX: Self = Self(u64::MAX);

    /// Parses the decimal representation used on the wire
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` isn't a decimal `u64`.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, ParseUintError> {
        util::parse_u64(buf).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SubscriptionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SubscriptionId> for u64 {
    fn from(id: SubscriptionId) -> Self {
        id.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
