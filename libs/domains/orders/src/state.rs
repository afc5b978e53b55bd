//! Order lifecycle projection
//!
//! `CREATED -> RESERVED -> CONFIRMED`, or `CREATED -> FAILED`. The state of an order
//! is inferred from the events observed for its correlation id.

use event_pipeline::{Event, EventType};
use serde::Serialize;
use std::collections::HashMap;
use strum::{AsRefStr, Display};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Reserved,
    Confirmed,
    Failed,
}

impl OrderState {
    /// State reached by observing `event_type`, if the transition is legal.
    pub fn next(current: Option<Self>, event_type: EventType) -> Option<Self> {
        use OrderState::*;

        match (current, event_type) {
            (None, EventType::OrderCreated) => Some(Created),
            (Some(Created), EventType::InventoryReserved) => Some(Reserved),
            (Some(Reserved), EventType::OrderConfirmed) => Some(Confirmed),
            (Some(Created), EventType::OrderFailed) => Some(Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Confirmed | OrderState::Failed)
    }
}

/// Per-order states folded from an event stream.
#[derive(Debug, Clone, Default)]
pub struct OrderTimeline {
    states: HashMap<Uuid, OrderState>,
    ignored: usize,
}

impl OrderTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a stream of events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut timeline = Self::new();
        for event in events {
            timeline.observe(event);
        }
        timeline
    }

    /// Apply one event. Returns false for duplicates and illegal transitions, which
    /// leave the state unchanged.
    pub fn observe(&mut self, event: &Event) -> bool {
        let current = self.states.get(&event.correlation_id).copied();
        match OrderState::next(current, event.event_type) {
            Some(next) => {
                self.states.insert(event.correlation_id, next);
                true
            }
            None => {
                self.ignored += 1;
                false
            }
        }
    }

    pub fn state(&self, correlation_id: Uuid) -> Option<OrderState> {
        self.states.get(&correlation_id).copied()
    }

    /// Events that did not advance any order
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
