//! Consumer lifecycle state machine
//!
//! ```text
//! STARTING ──Subscribed──► RUNNING ──Failed / CloseRequested──► CLOSING ──Unwound──► CLOSED
//!     │                                                                              ▲
//!     └────────────────SubscriptionFailed / CloseRequested───────────────────────────┘
//! ```
//!
//! No transition re-enters an earlier state and CLOSED is terminal. Events that
//! do not apply to the current state are ignored.
//!
//! Which terminations reach the close handler is fixed:
//!
//! | trigger         | close handler        | final commit |
//! |-----------------|----------------------|--------------|
//! | PollFailure     | yes, `Poll(cause)`   | no           |
//! | CommitFailure   | yes, `Commit(cause)` | no           |
//! | HandlerFailure  | no                   | yes          |
//! | ExplicitClose   | no                   | yes          |

use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::broker::Record;
use crate::error::{BrokerError, ConsumerError};
use crate::metrics_consts::{CONSUMERS_ACTIVE, CONSUMER_STATE_TRANSITIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Starting,
    Running,
    Closing,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Starting => "starting",
            ConsumerState::Running => "running",
            ConsumerState::Closing => "closing",
            ConsumerState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Closed)
    }

    /// Apply an event, returning the resulting state and the effect the
    /// lifecycle manager has to carry out.
    pub fn transition(self, event: LifecycleEvent) -> Transition {
        use ConsumerState::{Closed, Closing, Running, Starting};

        let (to, effect) = match (self, event) {
            (Starting, LifecycleEvent::Subscribed) => (Running, Effect::Ready),
            (Starting, LifecycleEvent::SubscriptionFailed) => (Closed, Effect::StartFailed),
            (Starting, LifecycleEvent::CloseRequested) => (Closed, Effect::StartFailed),

            (Running, LifecycleEvent::Failed(failure)) => {
                (Closing, Effect::Unwind(Termination::from(failure)))
            }
            (Running, LifecycleEvent::CloseRequested) => (
                Closing,
                Effect::Unwind(Termination {
                    reason: TerminationReason::ExplicitClose,
                    notify: None,
                }),
            ),

            (Closing, LifecycleEvent::Unwound) => (Closed, Effect::Released),

            (state, _) => (state, Effect::None),
        };

        Transition {
            from: self,
            to,
            effect,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by one of the consumer's stages. Consumed exactly once
/// by the lifecycle manager.
#[derive(Debug)]
pub enum FailureRecord {
    Poll(BrokerError),
    Handler { cause: anyhow::Error, record: Record },
    Commit(BrokerError),
}

#[derive(Debug)]
pub enum LifecycleEvent {
    Subscribed,
    SubscriptionFailed,
    Failed(FailureRecord),
    CloseRequested,
    /// In-flight work of the CLOSING phase finished and resources are released
    Unwound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    PollFailure,
    HandlerFailure,
    CommitFailure,
    ExplicitClose,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::PollFailure => "poll_failure",
            TerminationReason::HandlerFailure => "handler_failure",
            TerminationReason::CommitFailure => "commit_failure",
            TerminationReason::ExplicitClose => "explicit_close",
        }
    }

    /// Whether handled offsets are committed once more while closing. The
    /// broker is not trusted after a poll or commit failed.
    pub fn commits_on_close(&self) -> bool {
        matches!(
            self,
            TerminationReason::HandlerFailure | TerminationReason::ExplicitClose
        )
    }
}

/// Why a running consumer stops, and what (if anything) its close handler gets.
#[derive(Debug)]
pub struct Termination {
    pub reason: TerminationReason,
    pub notify: Option<ConsumerError>,
}

impl From<FailureRecord> for Termination {
    fn from(failure: FailureRecord) -> Self {
        match failure {
            FailureRecord::Poll(cause) => Termination {
                reason: TerminationReason::PollFailure,
                notify: Some(ConsumerError::Poll(cause)),
            },
            // the handler's error is the caller's own, it was logged at dispatch
            FailureRecord::Handler { .. } => Termination {
                reason: TerminationReason::HandlerFailure,
                notify: None,
            },
            FailureRecord::Commit(cause) => Termination {
                reason: TerminationReason::CommitFailure,
                notify: Some(ConsumerError::Commit(cause)),
            },
        }
    }
}

#[derive(Debug)]
pub enum Effect {
    None,
    /// Resolve the factory's result with the running consumer
    Ready,
    /// Fail the factory's result, the close handler is not involved
    StartFailed,
    /// Stop polling, let in-flight work finish, then release the broker
    Unwind(Termination),
    Released,
}

#[derive(Debug)]
pub struct Transition {
    pub from: ConsumerState,
    pub to: ConsumerState,
    pub effect: Effect,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Holds a consumer's single state instance and publishes every change to
/// the consumer's handles.
pub struct Lifecycle {
    state: ConsumerState,
    state_tx: watch::Sender<ConsumerState>,
    tenant_id: String,
}

impl Lifecycle {
    pub fn new(tenant_id: &str) -> (Self, watch::Receiver<ConsumerState>) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Starting);
        let lifecycle = Self {
            state: ConsumerState::Starting,
            state_tx,
            tenant_id: tenant_id.to_string(),
        };
        (lifecycle, state_rx)
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn apply(&mut self, event: LifecycleEvent) -> Effect {
        let transition = self.state.transition(event);
        if !transition.changed() {
            return transition.effect;
        }

        info!(
            tenant_id = %self.tenant_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "Consumer state changed"
        );
        metrics::counter!(
            CONSUMER_STATE_TRANSITIONS,
            "from" => transition.from.as_str(),
            "to" => transition.to.as_str()
        )
        .increment(1);

        match (transition.from, transition.to) {
            (ConsumerState::Starting, ConsumerState::Running) => {
                metrics::gauge!(CONSUMERS_ACTIVE).increment(1.0)
            }
            (ConsumerState::Closing, ConsumerState::Closed) => {
                metrics::gauge!(CONSUMERS_ACTIVE).decrement(1.0)
            }
            _ => {}
        }

        self.state = transition.to;
        self.state_tx.send_replace(transition.to);
        transition.effect
    }
}
