//! Unified engine state and its translation from transport states.

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tracing::{debug, warn};

use livecast_ipc::{EngineEvent, EngineState, Protocol, RtmpState, SrtState, StateListener};

/// Engine state for an RTMP session state, or `None` when the transition
/// does not change what the owner sees.
pub fn engine_state_for_rtmp(state: RtmpState) -> Option<EngineState> {
    let protocol = Protocol::Rtmp;
    match state {
        RtmpState::Disconnected => None,
        RtmpState::SessionStarted => Some(EngineState::Live { protocol }),
        RtmpState::Reconnecting => Some(EngineState::Reconnecting { protocol }),
        RtmpState::Ended => Some(EngineState::Ended),
        RtmpState::Error => Some(EngineState::Error {
            message: "RTMP session failed".to_string(),
            recoverable: true,
        }),
        connecting => {
            debug_assert!(connecting.is_connecting());
            Some(EngineState::Starting { protocol })
        }
    }
}

/// Engine state for an SRT session state.
///
/// `NotConnected` is always followed by `Reconnecting` or `Error`, so it
/// maps to nothing on its own.
pub fn engine_state_for_srt(state: SrtState) -> Option<EngineState> {
    let protocol = Protocol::Srt;
    match state {
        SrtState::None | SrtState::NotConnected => None,
        SrtState::Connecting => Some(EngineState::Starting { protocol }),
        SrtState::Connected => Some(EngineState::Live { protocol }),
        SrtState::Reconnecting => Some(EngineState::Reconnecting { protocol }),
        SrtState::Error => Some(EngineState::Error {
            message: "SRT session failed".to_string(),
            recoverable: true,
        }),
    }
}

/// Owns the engine state and publishes every change as an event.
///
/// Transport sessions report through it from their own threads.
pub struct StateBridge {
    state: RwLock<EngineState>,
    event_tx: Sender<EngineEvent>,
}

impl StateBridge {
    pub fn new(event_tx: Sender<EngineEvent>) -> Self {
        Self {
            state: RwLock::new(EngineState::Idle),
            event_tx,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.read().clone()
    }

    /// Move to `new_state`. Returns false if it was already current.
    pub fn transition_to(&self, new_state: EngineState) -> bool {
        let previous = {
            let mut state = self.state.write();
            if *state == new_state {
                return false;
            }
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
        true
    }

    /// Apply a state reported by a transport. Ignored once the owner has
    /// stopped the session.
    fn transport_transition(&self, new_state: Option<EngineState>) {
        let Some(new_state) = new_state else {
            return;
        };
        {
            let state = self.state.read();
            if state.is_idle() || state.is_stopping() {
                debug!(ignored = %new_state.name(), "Session stopped, ignoring transport state");
                return;
            }
        }
        self.transition_to(new_state);
    }

    pub fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl StateListener<RtmpState> for StateBridge {
    fn on_state_changed(&self, previous: RtmpState, current: RtmpState) {
        debug!(previous = previous.name(), current = current.name(), "RTMP state");
        self.transport_transition(engine_state_for_rtmp(current));
    }
}

impl StateListener<SrtState> for StateBridge {
    fn on_state_changed(&self, previous: SrtState, current: SrtState) {
        debug!(previous = previous.name(), current = current.name(), "SRT state");
        self.transport_transition(engine_state_for_srt(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> (StateBridge, crossbeam_channel::Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (StateBridge::new(tx), rx)
    }

    fn current_states(rx: &crossbeam_channel::Receiver<EngineEvent>) -> Vec<&'static str> {
        rx.try_iter()
            .filter_map(|event| match event {
                EngineEvent::StateChanged { current, .. } => Some(current.name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_rtmp_mapping() {
        assert_eq!(engine_state_for_rtmp(RtmpState::Disconnected), None);
        assert!(engine_state_for_rtmp(RtmpState::Handshake1S0)
            .is_some_and(|s| s.is_starting()));
        assert!(engine_state_for_rtmp(RtmpState::SessionStarted).is_some_and(|s| s.is_live()));
        assert_eq!(engine_state_for_rtmp(RtmpState::Ended), Some(EngineState::Ended));
        assert!(engine_state_for_rtmp(RtmpState::Error).is_some_and(|s| s.is_error()));
    }

    #[test]
    fn test_srt_mapping() {
        assert_eq!(engine_state_for_srt(SrtState::NotConnected), None);
        assert_eq!(
            engine_state_for_srt(SrtState::Reconnecting),
            Some(EngineState::Reconnecting {
                protocol: Protocol::Srt
            })
        );
    }

    #[test]
    fn test_handshake_steps_collapse_into_one_event() {
        let (bridge, rx) = bridge();
        bridge.transition_to(EngineState::Starting {
            protocol: Protocol::Rtmp,
        });
        for (prev, cur) in [
            (RtmpState::Disconnected, RtmpState::TcpConnected),
            (RtmpState::TcpConnected, RtmpState::Handshake0),
            (RtmpState::Handshake0, RtmpState::HandshakeComplete),
            (RtmpState::Ready, RtmpState::SessionStarted),
        ] {
            StateListener::<RtmpState>::on_state_changed(&bridge, prev, cur);
        }
        assert_eq!(current_states(&rx), vec!["Starting", "Live"]);
    }

    #[test]
    fn test_transport_states_ignored_when_idle() {
        let (bridge, rx) = bridge();
        StateListener::<SrtState>::on_state_changed(&bridge, SrtState::None, SrtState::Connecting);
        assert!(bridge.state().is_idle());
        assert!(current_states(&rx).is_empty());
    }
}
