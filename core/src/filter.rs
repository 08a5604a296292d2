//! Subscription filters deciding which events reach which consumer.
//!
//! A filter is a conjunction of clauses. Each clause is a membership test
//! against an allow-set:
//!
//! - the **event-type clause** checks [`Event::event_type`]
//! - each **attribute clause** checks one entry of [`Event::attributes`]
//!
//! A filter with no clauses accepts every event. A missing attribute fails its
//! clause. Evaluation is pure and synchronous; the event bus runs it for every
//! subscription during publish and silently skips subscribers that do not match.
//!
//! # Example
//!
//! ```
//! use orderflow_core::event::{Event, EventType};
//! use orderflow_core::filter::SubscriptionFilter;
//! use chrono::Utc;
//!
//! let email = SubscriptionFilter::event_types([EventType::OrderConfirmed, EventType::OrderShipped]);
//! let created = Event::new(EventType::OrderCreated, "o-1", "c-1", Utc::now());
//!
//! assert!(!email.matches(&created));
//! ```

use crate::event::{Event, EventType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Predicate over event type and attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Allowed event types. `None` means the clause is absent.
    event_types: Option<BTreeSet<EventType>>,

    /// Attribute clauses: key → allowed values.
    attributes: BTreeMap<String, BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// Filter with no clauses; matches every event.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Filter whose only clause is event-type membership in `types`.
    ///
    /// An empty allow-set matches nothing.
    #[must_use]
    pub fn event_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: Some(types.into_iter().collect()),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute clause: `key` must be present with one of `values`.
    #[must_use]
    pub fn with_attribute<V: Into<String>>(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.attributes
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Whether the event-type clause admits `event_type`.
    #[must_use]
    pub fn allows(&self, event_type: EventType) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&event_type))
    }

    /// Evaluate every clause against `event`.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.allows(event.event_type)
            && self.attributes.iter().all(|(key, allowed)| {
                event
                    .attributes
                    .get(key)
                    .is_some_and(|value| allowed.contains(value))
            })
    }
}

/// Free-function form of [`SubscriptionFilter::matches`].
#[must_use]
pub fn matches(event: &Event, filter: &SubscriptionFilter) -> bool {
    filter.matches(event)
}
