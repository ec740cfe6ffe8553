//! Connection state machine.
//!
//! State machine: Disconnected -> Connecting -> ConfiguringTopology -> Ready,
//! with every non-`Disconnected` state able to fall back to `Disconnected`.

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A transport connect call is in flight.
    Connecting,
    /// Connected; exchanges, queue and bindings are being declared.
    ConfiguringTopology,
    /// Topology is in place and the inbox is being consumed.
    Ready,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConfiguringTopology => "configuring_topology",
            Self::Ready => "ready",
        }
    }
}

/// Capacity of the transition broadcast. Slow observers lag rather than
/// block transitions.
const TRANSITION_BUFFER: usize = 64;

/// Guarded holder for the current state.
///
/// Transitions are compare-and-set so that only the caller who observed the
/// expected source state wins. Every applied transition is broadcast in
/// order to subscribers.
#[derive(Debug)]
pub struct StateMachine {
    current: Mutex<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        let (transitions, _rx) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            transitions,
        }
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Moves `from -> to` if the current state is `from`.
    ///
    /// Returns `false`, leaving the state untouched, otherwise.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut current = self.current.lock();
        if *current != from {
            return false;
        }
        *current = to;
        // Sent under the lock so subscribers see transitions in order.
        let _ = self.transitions.send(to);
        true
    }

    /// Forces the state to `Disconnected` from wherever it is.
    ///
    /// Returns the previous state. Nothing is broadcast when already
    /// disconnected.
    pub fn disconnect(&self) -> ConnectionState {
        let mut current = self.current.lock();
        let previous = *current;
        if previous != ConnectionState::Disconnected {
            *current = ConnectionState::Disconnected;
            let _ = self.transitions.send(ConnectionState::Disconnected);
        }
        previous
    }

    /// Receives every transition applied after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        assert_eq!(StateMachine::new().get(), ConnectionState::Disconnected);
    }

    #[test]
    fn transition_requires_expected_source() {
        let machine = StateMachine::new();
        assert!(!machine.transition(ConnectionState::Connecting, ConnectionState::Ready));
        assert_eq!(machine.get(), ConnectionState::Disconnected);

        assert!(machine.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        // A second concurrent connect observes Connecting and loses.
        assert!(!machine.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(machine.get(), ConnectionState::Connecting);
    }

    #[test]
    fn subscribers_see_transitions_in_order() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.transition(ConnectionState::Disconnected, ConnectionState::Connecting);
        machine.transition(ConnectionState::Connecting, ConnectionState::ConfiguringTopology);
        machine.transition(ConnectionState::ConfiguringTopology, ConnectionState::Ready);
        machine.disconnect();

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::ConfiguringTopology,
                ConnectionState::Ready,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn disconnect_when_disconnected_is_silent() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();
        assert_eq!(machine.disconnect(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionState::ConfiguringTopology.as_str(), "configuring_topology");
        assert_eq!(ConnectionState::Ready.as_str(), "ready");
    }
}
