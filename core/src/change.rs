//! Domain-change messages.
//!
//! Every authoritative change is published as a [`ChangeMessage`]: a routing
//! key naming the change kind plus a JSON body carrying `id`, `public_id`,
//! `version` and the changed fields. Consumers decode the routing key once
//! into [`EventChange`] or [`UserChange`] and dispatch with `match`.
//!
//! # Routing keys
//!
//! | domain | keys |
//! |--------|------|
//! | events | `event.created`, `event.updated`, `event.deleted`, `event.seats.updated` |
//! | users  | `user.created`, `user.updated`, `user.deleted` |
//!
//! Subscriptions bind [`RoutingPattern`]s where `*` matches exactly one word
//! and `#` matches zero or more words.

use crate::snapshot::{EventSnapshot, UserSnapshot};
use crate::types::{EventId, PublicId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Routing key constants.
pub mod routing_keys {
    /// An event was registered.
    pub const EVENT_CREATED: &str = "event.created";
    /// An event's fields were revised.
    pub const EVENT_UPDATED: &str = "event.updated";
    /// An event was removed.
    pub const EVENT_DELETED: &str = "event.deleted";
    /// An event's available seat count changed.
    pub const EVENT_SEATS_UPDATED: &str = "event.seats.updated";
    /// A user was created.
    pub const USER_CREATED: &str = "user.created";
    /// A user was updated.
    pub const USER_UPDATED: &str = "user.updated";
    /// A user was removed.
    pub const USER_DELETED: &str = "user.deleted";
}

/// Errors decoding or encoding change messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    /// The body does not match the routing key's payload.
    #[error("Malformed '{routing_key}' payload: {reason}")]
    Malformed {
        /// Routing key of the offending message.
        routing_key: String,
        /// Decoder message.
        reason: String,
    },

    /// A payload could not be serialized.
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// A change message as carried by the bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Change kind, e.g. `event.seats.updated`.
    pub routing_key: String,
    /// Unique per publish; kept across redeliveries.
    pub message_id: String,
    /// Partition key: the entity id.
    pub key: String,
    /// JSON payload.
    pub body: Vec<u8>,
    /// How many times this message has been handed back for redelivery.
    #[serde(default)]
    pub redeliveries: u32,
}

impl ChangeMessage {
    /// Build a message with a fresh message id.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            message_id: Uuid::new_v4().to_string(),
            key: key.into(),
            body,
            redeliveries: 0,
        }
    }

    /// Build a message with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::Encode`] if `payload` cannot be serialized.
    pub fn json<T: Serialize>(
        routing_key: &str,
        key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ChangeError> {
        let body = serde_json::to_vec(payload).map_err(|e| ChangeError::Encode(e.to_string()))?;
        Ok(Self::new(routing_key, key, body))
    }

    /// The same message handed back once more.
    #[must_use]
    pub fn redelivered(mut self) -> Self {
        self.redeliveries = self.redeliveries.saturating_add(1);
        self
    }

    fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ChangeError> {
        serde_json::from_slice(&self.body).map_err(|e| ChangeError::Malformed {
            routing_key: self.routing_key.clone(),
            reason: e.to_string(),
        })
    }
}

/// Payload of a deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removed<I> {
    /// Upstream id.
    pub id: I,
    /// Upstream public id.
    pub public_id: PublicId,
    /// Upstream version at deletion.
    #[serde(default)]
    pub version: u64,
}

/// Payload of `event.seats.updated`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatCount {
    /// Upstream event id.
    pub id: EventId,
    /// Upstream public id.
    pub public_id: PublicId,
    /// Seats left on the ledger.
    pub available_seats: u64,
    /// Ledger version after the change.
    pub version: u64,
}

/// A decoded change to an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventChange {
    /// `event.created`
    Created(EventSnapshot),
    /// `event.updated`
    Updated(EventSnapshot),
    /// `event.deleted`
    Deleted(Removed<EventId>),
    /// `event.seats.updated`
    SeatsUpdated(SeatCount),
}

impl EventChange {
    /// Classify and decode a message.
    ///
    /// Returns `Ok(None)` for routing keys this domain does not know.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::Malformed`] if the body does not fit the key.
    pub fn decode(message: &ChangeMessage) -> Result<Option<Self>, ChangeError> {
        let change = match message.routing_key.as_str() {
            routing_keys::EVENT_CREATED => Self::Created(message.decode_body()?),
            routing_keys::EVENT_UPDATED => Self::Updated(message.decode_body()?),
            routing_keys::EVENT_DELETED => Self::Deleted(message.decode_body()?),
            routing_keys::EVENT_SEATS_UPDATED => Self::SeatsUpdated(message.decode_body()?),
            _ => return Ok(None),
        };
        Ok(Some(change))
    }

    /// Routing key for this change.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        match self {
            Self::Created(_) => routing_keys::EVENT_CREATED,
            Self::Updated(_) => routing_keys::EVENT_UPDATED,
            Self::Deleted(_) => routing_keys::EVENT_DELETED,
            Self::SeatsUpdated(_) => routing_keys::EVENT_SEATS_UPDATED,
        }
    }

    /// Id of the changed event.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Created(s) | Self::Updated(s) => s.id,
            Self::Deleted(r) => r.id,
            Self::SeatsUpdated(c) => c.id,
        }
    }

    /// Encode for publishing, keyed by event id.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::Encode`] if serialization fails.
    pub fn to_message(&self) -> Result<ChangeMessage, ChangeError> {
        let key = self.event_id().to_string();
        match self {
            Self::Created(s) | Self::Updated(s) => ChangeMessage::json(self.routing_key(), key, s),
            Self::Deleted(r) => ChangeMessage::json(self.routing_key(), key, r),
            Self::SeatsUpdated(c) => ChangeMessage::json(self.routing_key(), key, c),
        }
    }
}

/// A decoded change to a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserChange {
    /// `user.created`
    Created(UserSnapshot),
    /// `user.updated`
    Updated(UserSnapshot),
    /// `user.deleted`
    Deleted(Removed<UserId>),
}

impl UserChange {
    /// Classify and decode a message.
    ///
    /// Returns `Ok(None)` for routing keys this domain does not know.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::Malformed`] if the body does not fit the key.
    pub fn decode(message: &ChangeMessage) -> Result<Option<Self>, ChangeError> {
        let change = match message.routing_key.as_str() {
            routing_keys::USER_CREATED => Self::Created(message.decode_body()?),
            routing_keys::USER_UPDATED => Self::Updated(message.decode_body()?),
            routing_keys::USER_DELETED => Self::Deleted(message.decode_body()?),
            _ => return Ok(None),
        };
        Ok(Some(change))
    }

    /// Routing key for this change.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        match self {
            Self::Created(_) => routing_keys::USER_CREATED,
            Self::Updated(_) => routing_keys::USER_UPDATED,
            Self::Deleted(_) => routing_keys::USER_DELETED,
        }
    }

    /// Id of the changed user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        match self {
            Self::Created(s) | Self::Updated(s) => s.id,
            Self::Deleted(r) => r.id,
        }
    }

    /// Encode for publishing, keyed by user id.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError::Encode`] if serialization fails.
    pub fn to_message(&self) -> Result<ChangeMessage, ChangeError> {
        let key = self.user_id().to_string();
        match self {
            Self::Created(s) | Self::Updated(s) => ChangeMessage::json(self.routing_key(), key, s),
            Self::Deleted(r) => ChangeMessage::json(self.routing_key(), key, r),
        }
    }
}

/// A topic-style routing key pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingPattern {
    raw: String,
}

impl RoutingPattern {
    /// Wrap a pattern such as `event.*` or `user.#`.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            raw: pattern.into(),
        }
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `routing_key` is bound by this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.raw.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&pattern, &key)
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((head, rest)) => match key.split_first() {
            Some((word, tail)) => (*head == "*" || head == word) && match_words(rest, tail),
            None => false,
        },
    }
}
