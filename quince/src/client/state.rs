use crate::atomic::{AtomicU8, Ordering};

const STATE_MASK: u8 = 0b0000_0111;
const IS_LAMEDUCK: u8 = 1 << 5;
const IS_FAILED_UNSUBSCRIBE: u8 = 1 << 7;

/// Lifecycle of a [`Client`] connection
///
/// ```text
/// Connecting -> Connected <-> Reconnecting
///                   |              |
///                   v              v
///          DrainingSubscriptions -> DrainingConnection -> Closed
/// ```
///
/// Any state may move to [`ConnectionState::Closed`].
///
/// [`Client`]: crate::core::Client
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    /// Subscriptions are being drained, new subscriptions are refused
    DrainingSubscriptions,
    /// Pending publishes are being flushed before closing
    DrainingConnection,
    Closed,
}

/// Connection state plus a few flags, packed in a single atomic
#[derive(Debug)]
pub(crate) struct RawClientState(AtomicU8);

impl RawClientState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting.encode()))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_lameduck(&self) -> bool {
        self.0.load(Ordering::Acquire) & IS_LAMEDUCK != 0
    }

    pub(crate) fn is_failed_unsubscribe(&self) -> bool {
        self.0.load(Ordering::Acquire) & IS_FAILED_UNSUBSCRIBE != 0
    }

    pub(crate) fn store_is_lameduck(&self, val: bool) {
        self.store_bit(IS_LAMEDUCK, val);
    }

    pub(crate) fn store_is_failed_unsubscribe(&self, val: bool) {
        self.store_bit(IS_FAILED_UNSUBSCRIBE, val);
    }

    /// `Connecting` or `Reconnecting` to `Connected`
    ///
    /// A connection that started draining while reconnecting stays draining.
    pub(crate) fn set_connected(&self) {
        let _ = self.transition(|state| {
            matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
            .then_some(ConnectionState::Connected)
        });
    }

    /// `Connected` to `Reconnecting`
    pub(crate) fn set_reconnecting(&self) {
        let _ = self.transition(|state| {
            matches!(state, ConnectionState::Connected).then_some(ConnectionState::Reconnecting)
        });
    }

    /// Enters `DrainingSubscriptions`
    ///
    /// Returns the current state if the connection is already draining or
    /// closed.
    pub(crate) fn begin_drain(&self) -> Result<(), ConnectionState> {
        self.transition(|state| match state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => Some(ConnectionState::DrainingSubscriptions),
            ConnectionState::DrainingSubscriptions
            | ConnectionState::DrainingConnection
            | ConnectionState::Closed => None,
        })
        .map(|_| ())
    }

    /// `DrainingSubscriptions` to `DrainingConnection`
    pub(crate) fn set_draining_connection(&self) {
        let _ = self.transition(|state| {
            matches!(state, ConnectionState::DrainingSubscriptions)
                .then_some(ConnectionState::DrainingConnection)
        });
    }

    /// Moves to `Closed`, returning `true` only for the call that did it
    pub(crate) fn set_closed(&self) -> bool {
        self.transition(|state| {
            (state != ConnectionState::Closed).then_some(ConnectionState::Closed)
        })
        .is_ok()
    }

    fn transition<F>(&self, mut f: F) -> Result<ConnectionState, ConnectionState>
    where
        F: FnMut(ConnectionState) -> Option<ConnectionState>,
    {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let next = f(ConnectionState::decode(raw))?;
                Some((raw & !STATE_MASK) | next.encode())
            })
            .map(ConnectionState::decode)
            .map_err(ConnectionState::decode)
    }

    fn store_bit(&self, mask: u8, val: bool) {
        debug_assert_eq!(mask.count_ones(), 1);

        if val {
            self.0.fetch_or(mask, Ordering::AcqRel);
        } else {
            self.0.fetch_and(!mask, Ordering::AcqRel);
        }
    }
}

impl ConnectionState {
    /// Returns `true` once the connection is draining or closed
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            Self::DrainingSubscriptions | Self::DrainingConnection | Self::Closed
        )
    }

    fn encode(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Reconnecting => 2,
            Self::DrainingSubscriptions => 3,
            Self::DrainingConnection => 4,
            Self::Closed => 5,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw & STATE_MASK {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Reconnecting,
            3 => Self::DrainingSubscriptions,
            4 => Self::DrainingConnection,
            _ => Self::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err_eq, assert_ok};

    use super::{ConnectionState, RawClientState};

    #[test]
    fn reconnect_cycle() {
        let state = RawClientState::new();
        assert_eq!(ConnectionState::Connecting, state.get());

        state.set_reconnecting();
        assert_eq!(ConnectionState::Connecting, state.get());

        state.set_connected();
        assert_eq!(ConnectionState::Connected, state.get());
        state.set_reconnecting();
        assert_eq!(ConnectionState::Reconnecting, state.get());
        state.set_connected();
        assert_eq!(ConnectionState::Connected, state.get());
    }

    #[test]
    fn drain_then_close() {
        let state = RawClientState::new();
        state.set_connected();

        assert_ok!(state.begin_drain());
        assert_err_eq!(
            state.begin_drain(),
            ConnectionState::DrainingSubscriptions
        );

        // a reconnect during the drain doesn't resurrect the connection
        state.set_reconnecting();
        state.set_connected();
        assert_eq!(ConnectionState::DrainingSubscriptions, state.get());

        state.set_draining_connection();
        assert_eq!(ConnectionState::DrainingConnection, state.get());

        assert!(state.set_closed());
        assert!(!state.set_closed());
        assert_eq!(ConnectionState::Closed, state.get());
        assert_err_eq!(state.begin_drain(), ConnectionState::Closed);
    }

    #[test]
    fn flags_survive_transitions() {
        let state = RawClientState::new();
        state.store_is_lameduck(true);
        state.store_is_failed_unsubscribe(true);

        state.set_connected();
        assert_eq!(ConnectionState::Connected, state.get());
        assert!(state.is_lameduck());
        assert!(state.is_failed_unsubscribe());

        state.store_is_failed_unsubscribe(false);
        assert!(state.set_closed());
        assert!(state.is_lameduck());
        assert!(!state.is_failed_unsubscribe());
    }
}
