// =============================================================================
// Error Taxonomy — kinds, not a type hierarchy (spec §7)
// =============================================================================
//
// Only `Fatal` ever unwinds to the supervisor. Everything else is logged and
// absorbed at the point it is detected; a single bad message never tears
// down a socket or taints an engine's existing state.
// =============================================================================

use thiserror::Error;

use crate::model::Venue;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Socket drop or frame-level parse failure. Handled locally by the
    /// adapter: reconnect with backoff.
    #[error("transport error on {venue}: {detail}")]
    Transport { venue: Venue, detail: String },

    /// Malformed payload or unknown channel. Message is dropped, socket
    /// survives.
    #[error("protocol error on {venue}: {detail}")]
    Protocol { venue: Venue, detail: String },

    /// Delta for an unknown (venue, symbol), or a negative size. Logged and
    /// dropped; existing state is untouched.
    #[error("state error on {venue}/{symbol}: {detail}")]
    State {
        venue: Venue,
        symbol: String,
        detail: String,
    },

    /// Publish or cache write failure. In-memory state remains
    /// authoritative; the next tick retries naturally.
    #[error("cache error: {detail}")]
    Cache { detail: String },

    /// An invariant that should be impossible was violated. Surfaced to the
    /// supervisor, which triggers shutdown.
    #[error("fatal error: {detail}")]
    Fatal { detail: String },
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal { .. })
    }
}
