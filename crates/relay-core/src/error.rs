//! Error types for relay-core operations

use thiserror::Error;

/// Errors that terminate startup or a whole operation
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Bind-host resolution failed
    #[error("can't resolve bind address {host}: {reason}")]
    BindHost { host: String, reason: String },

    /// Media port range exhausted or listener creation failed
    #[error("can't create listener: {0}")]
    Listener(String),

    /// I/O error outside the lossy media path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A control-command failure carrying its stable wire code.
///
/// The numeric codes are part of the wire contract and must not be
/// renumbered. Codes 5 and 11–14 are reserved for per-site allocation
/// failures that cannot occur here and are left unassigned.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No tokens at all (or a lone cookie in datagram mode)
    #[error("command syntax error")]
    Empty,

    /// Malformed arity or modifiers on D/R/S, bad Z value, excess
    /// address selectors
    #[error("command syntax error")]
    Syntax,

    /// Wrong arity on a version query
    #[error("command syntax error")]
    VersionArity,

    /// Unknown command verb
    #[error("unknown command")]
    UnknownVerb,

    /// Wrong arity on U/L/P
    #[error("command syntax error")]
    RequestArity,

    /// Every codec in a play request failed to build a player
    #[error("can't create player")]
    PlayerCreate,

    /// Listener creation failed while completing an existing session
    #[error("can't create listener")]
    ListenerExisting,

    /// Session lookup failed for a verb that requires one
    #[error("session not found")]
    NotFound,

    /// Listener creation failed for a new session
    #[error("can't create listener")]
    ListenerCreate,
}

impl CommandError {
    /// Stable wire error code rendered as `E<code>`
    pub fn code(&self) -> u8 {
        match self {
            CommandError::Empty => 0,
            CommandError::Syntax => 1,
            CommandError::VersionArity => 2,
            CommandError::UnknownVerb => 3,
            CommandError::RequestArity => 4,
            CommandError::PlayerCreate => 6,
            CommandError::ListenerExisting => 7,
            CommandError::NotFound => 8,
            CommandError::ListenerCreate => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(CommandError::Empty.code(), 0);
        assert_eq!(CommandError::Syntax.code(), 1);
        assert_eq!(CommandError::VersionArity.code(), 2);
        assert_eq!(CommandError::UnknownVerb.code(), 3);
        assert_eq!(CommandError::RequestArity.code(), 4);
        assert_eq!(CommandError::PlayerCreate.code(), 6);
        assert_eq!(CommandError::ListenerExisting.code(), 7);
        assert_eq!(CommandError::NotFound.code(), 8);
        assert_eq!(CommandError::ListenerCreate.code(), 10);
    }
}
