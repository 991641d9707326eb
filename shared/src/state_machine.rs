//! Subscription State Machine
//!
//! Defines the per-device subscription lifecycle:
//!
//! ```text
//! unsubscribed -> subscribing -> active
//!                      |            |
//!                      v            v
//!                   failed <--------+  (feed lost)
//!                      |
//!                      v
//!                 subscribing (retry)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::now_ms;

/// Lifecycle state of a device subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Active,
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Active => "active",
            SubscriptionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events that drive subscription transitions
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Caller asked for a subscription
    Requested,
    /// Transport confirmed the subscription
    Confirmed,
    /// Transport failed, timed out, or dropped a live feed
    TransportFailed { reason: String },
    /// Explicit teardown
    TornDown,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// State changed
    Changed(SubscriptionState),
    /// Event accepted but nothing to do (idempotent request)
    Unchanged(SubscriptionState),
    /// Event is not valid from the current state
    Invalid {
        from: SubscriptionState,
        event: SubscriptionEvent,
    },
}

/// Subscription lifecycle for one device
#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine {
    current_state: SubscriptionState,
    /// Number of times a subscribe call was started
    attempts: u32,
    last_error: Option<String>,
    changed_at_ms: u64,
}

impl Default for SubscriptionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionStateMachine {
    /// Create a new state machine in Unsubscribed state
    pub fn new() -> Self {
        Self {
            current_state: SubscriptionState::Unsubscribed,
            attempts: 0,
            last_error: None,
            changed_at_ms: now_ms(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.current_state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn changed_at_ms(&self) -> u64 {
        self.changed_at_ms
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SubscriptionEvent) -> TransitionResult {
        use SubscriptionEvent::*;
        use SubscriptionState::*;

        let next = match (self.current_state, &event) {
            (Unsubscribed | Failed, Requested) => {
                self.attempts += 1;
                Subscribing
            }

            // Idempotent: a live or in-flight subscription is left alone
            (Subscribing | Active, Requested) => {
                return TransitionResult::Unchanged(self.current_state);
            }

            (Subscribing, Confirmed) => {
                self.last_error = None;
                Active
            }
            (Subscribing | Active, TransportFailed { reason }) => {
                self.last_error = Some(reason.clone());
                Failed
            }

            (_, TornDown) => Unsubscribed,

            _ => {
                return TransitionResult::Invalid {
                    from: self.current_state,
                    event,
                };
            }
        };

        self.current_state = next;
        self.changed_at_ms = now_ms();
        TransitionResult::Changed(next)
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: SubscriptionState, to: SubscriptionState) -> bool {
    use SubscriptionState::*;

    match (from, to) {
        (a, b) if a == b => true,
        (_, Unsubscribed) => true,
        (Unsubscribed, Subscribing) => true,
        (Subscribing, Active) => true,
        (Subscribing, Failed) => true,
        (Active, Failed) => true,
        (Failed, Subscribing) => true,
        _ => false,
    }
}
