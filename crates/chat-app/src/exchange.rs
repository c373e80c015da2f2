use std::fmt;

/// Identifier for one send/reply exchange.
///
/// Every submit gets a fresh id so events from an abandoned stream can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl ExchangeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending(ExchangeId),
    Streaming(ExchangeId),
    Completed(ExchangeId),
    Failed {
        id: ExchangeId,
        message: String,
    },
    Cancelled(ExchangeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransition {
    Begin(ExchangeId),
    Open(ExchangeId),
    Complete(ExchangeId),
    Fail { id: ExchangeId, message: String },
    Cancel(ExchangeId),
    ResetToIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransitionRejection {
    AlreadyActive {
        active: ExchangeId,
        attempted: ExchangeId,
    },
    NoActiveExchange,
    ExchangeMismatch {
        active: ExchangeId,
        attempted: ExchangeId,
    },
}

pub type ExchangeTransitionResult = Result<ExchangeState, ExchangeTransitionRejection>;

impl ExchangeState {
    /// The exchange holding the single send slot, if any.
    pub fn active_exchange(&self) -> Option<ExchangeId> {
        match self {
            Self::Sending(id) | Self::Streaming(id) => Some(*id),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_exchange().is_some()
    }

    pub fn accepts_stream_event(&self, id: ExchangeId) -> bool {
        self.active_exchange() == Some(id)
    }

    pub fn is_terminal_for(&self, id: ExchangeId) -> bool {
        match self {
            Self::Completed(terminal) | Self::Cancelled(terminal) => *terminal == id,
            Self::Failed { id: terminal, .. } => *terminal == id,
            Self::Idle | Self::Sending(_) | Self::Streaming(_) => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending(_) => "sending",
            Self::Streaming(_) => "streaming",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Applies one transition.
    ///
    /// Only non-active states may begin a new exchange. `Open`, `Complete`,
    /// `Fail` and `Cancel` must name the active exchange exactly.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Begin(id) => self.apply_begin(id),
            ExchangeTransition::Open(id) => self.apply_open(id),
            ExchangeTransition::Complete(id) => self.apply_active(id, Self::Completed(id)),
            ExchangeTransition::Fail { id, message } => {
                self.apply_active(id, Self::Failed { id, message })
            }
            ExchangeTransition::Cancel(id) => self.apply_active(id, Self::Cancelled(id)),
            ExchangeTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_begin(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self.active_exchange() {
            Some(active) if active == id => Ok(self.clone()),
            Some(active) => Err(ExchangeTransitionRejection::AlreadyActive {
                active,
                attempted: id,
            }),
            None => Ok(Self::Sending(id)),
        }
    }

    fn apply_open(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == id => {
                Ok(Self::Streaming(id))
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::ExchangeMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(ExchangeTransitionRejection::NoActiveExchange)
            }
        }
    }

    fn apply_active(&self, id: ExchangeId, next: Self) -> ExchangeTransitionResult {
        match self.active_exchange() {
            Some(active) if active == id => Ok(next),
            Some(active) => Err(ExchangeTransitionRejection::ExchangeMismatch {
                active,
                attempted: id,
            }),
            None => Err(ExchangeTransitionRejection::NoActiveExchange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: ExchangeId = ExchangeId::new(1);
    const SECOND: ExchangeId = ExchangeId::new(2);

    #[test]
    fn happy_path_walks_every_state() {
        let state = ExchangeState::Idle
            .apply(ExchangeTransition::Begin(FIRST))
            .unwrap();
        assert_eq!(state, ExchangeState::Sending(FIRST));

        let state = state.apply(ExchangeTransition::Open(FIRST)).unwrap();
        assert!(state.accepts_stream_event(FIRST));
        assert!(!state.accepts_stream_event(SECOND));

        let state = state.apply(ExchangeTransition::Complete(FIRST)).unwrap();
        assert!(state.is_terminal_for(FIRST));
        assert!(!state.is_active());

        let state = state.apply(ExchangeTransition::ResetToIdle).unwrap();
        assert_eq!(state, ExchangeState::Idle);
    }

    #[test]
    fn second_begin_while_active_is_rejected() {
        let state = ExchangeState::Streaming(FIRST);
        assert_eq!(
            state.apply(ExchangeTransition::Begin(SECOND)),
            Err(ExchangeTransitionRejection::AlreadyActive {
                active: FIRST,
                attempted: SECOND,
            })
        );
    }

    #[test]
    fn stale_exchange_cannot_finish_the_active_one() {
        let state = ExchangeState::Sending(SECOND);
        assert_eq!(
            state.apply(ExchangeTransition::Cancel(FIRST)),
            Err(ExchangeTransitionRejection::ExchangeMismatch {
                active: SECOND,
                attempted: FIRST,
            })
        );
    }

    #[test]
    fn terminal_transitions_need_an_active_exchange() {
        let cancelled = ExchangeState::Cancelled(FIRST);
        assert_eq!(
            cancelled.apply(ExchangeTransition::Complete(FIRST)),
            Err(ExchangeTransitionRejection::NoActiveExchange)
        );
        assert_eq!(
            cancelled.apply(ExchangeTransition::Begin(SECOND)),
            Ok(ExchangeState::Sending(SECOND))
        );
    }

    #[test]
    fn failure_is_allowed_before_the_response_opens() {
        let state = ExchangeState::Sending(FIRST)
            .apply(ExchangeTransition::Fail {
                id: FIRST,
                message: "refused".to_string(),
            })
            .unwrap();
        assert_eq!(state.label(), "failed");
    }
}
