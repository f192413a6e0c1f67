//! Session identity generation.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::rngs::OsRng;

/// Alphabet for session identifiers: uppercase base-36.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a session identifier.
pub const ID_LEN: usize = 6;

/// Short rendezvous address for one running instance.
///
/// Six uppercase base-36 characters, generated once at startup and never
/// changed. Peers type this in, so parsing normalizes case and whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier from the OS RNG.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let token = (0..ID_LEN)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error from parsing a session identifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid session identifier: {0:?}")]
pub struct InvalidSessionId(String);

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase();
        if token.len() == ID_LEN && token.bytes().all(|b| ALPHABET.contains(&b)) {
            Ok(Self(token))
        } else {
            Err(InvalidSessionId(s.to_owned()))
        }
    }
}
