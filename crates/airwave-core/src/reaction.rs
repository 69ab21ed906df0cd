//! Ephemeral listener reactions.

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::RadioError;
use crate::event::{Event, EventPayload};
use airwave_protocol::{Emote, ReactionPayload};
use std::sync::Arc;
use tracing::trace;

/// Longest accepted user id, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Turns inbound reactions into `user_reaction` events.
///
/// Stateless and independent of the timeline: reactions never touch the
/// playback state and are not persisted.
#[derive(Clone)]
pub struct ReactionRelay {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ReactionRelay {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, clock }
    }

    /// Validate and publish one reaction.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a blank or oversized user id, or an emote outside
    /// the fixed set. Nothing is published in that case.
    pub fn submit(&self, user_id: &str, emote: &str) -> Result<ReactionPayload, RadioError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(RadioError::invalid("user_id must not be empty"));
        }
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(RadioError::invalid(format!(
                "user_id longer than {MAX_USER_ID_LEN} bytes"
            )));
        }
        let emote: Emote = emote
            .parse()
            .map_err(|_| RadioError::invalid(format!("unknown emote: {emote}")))?;

        let now = self.clock.now_millis();
        let reaction = ReactionPayload {
            user_id: user_id.to_string(),
            emote,
            timestamp: now,
        };
        trace!(user = %reaction.user_id, emote = %emote, "Reaction submitted");
        self.bus
            .publish(Event::new(EventPayload::UserReaction(reaction.clone()), now));
        Ok(reaction)
    }
}
