//! Call lifecycle state

/// Session-level status of one signaling connection.
///
/// Transitions are strictly one-directional; `Ended` is terminal. The
/// connection task owns the state and publishes it through a watch
/// channel, so consumers can await particular phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    /// Socket not yet open or offer not yet sent
    Idle,
    /// Local offer is on the wire; ICE candidates may now flow
    OfferSent,
    /// The remote assigned a session id
    SessionAssigned,
    /// Remote answer received and handed to the media layer
    Answered,
    /// `activate_session` and `stream_options` have been sent
    Activated,
    /// Torn down; no further outbound traffic of any kind
    Ended,
}

impl CallState {
    /// True once the terminal state is reached
    pub fn is_ended(&self) -> bool {
        matches!(self, CallState::Ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(CallState::Idle < CallState::OfferSent);
        assert!(CallState::OfferSent < CallState::SessionAssigned);
        assert!(CallState::SessionAssigned < CallState::Answered);
        assert!(CallState::Answered < CallState::Activated);
        assert!(CallState::Activated < CallState::Ended);
        assert!(CallState::Ended.is_ended());
    }
}
