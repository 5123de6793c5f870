//! Object identifiers and identifier generation

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Alphabet drawn from by [`IdGenerator`]
pub const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default generated identifier length
pub const DEFAULT_ID_LEN: usize = 10;

/// Identifier addressing one stored object across processes.
///
/// Caller-supplied identifiers are used verbatim. They must be non-empty, at
/// most [`ObjectId::MAX_LEN`] bytes, and free of control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Maximum identifier length in bytes
    pub const MAX_LEN: usize = 64;

    /// Validate and wrap an identifier
    pub fn new(id: impl Into<String>) -> ShmResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ShmError::InvalidIdentifier("identifier is empty".into()));
        }
        if id.len() > Self::MAX_LEN {
            return Err(ShmError::InvalidIdentifier(format!(
                "identifier is {} bytes, maximum is {}",
                id.len(),
                Self::MAX_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ShmError::InvalidIdentifier(format!(
                "identifier {id:?} contains control characters"
            )));
        }
        Ok(Self(id))
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ShmError;

    fn from_str(s: &str) -> ShmResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = ShmError;

    fn try_from(value: String) -> ShmResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = ShmError;

    fn try_from(value: &str) -> ShmResult<Self> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Random identifier generator.
///
/// Not cryptographically secure. With the default length the space is
/// 36^10 tokens, far beyond the object count a single store holds.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
    len: usize,
}

impl IdGenerator {
    /// Generator seeded from OS entropy producing [`DEFAULT_ID_LEN`] tokens
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            len: DEFAULT_ID_LEN,
        }
    }

    /// Generator seeded from OS entropy producing tokens of `len` characters.
    ///
    /// `len` must lie in `1..=ObjectId::MAX_LEN`.
    pub fn with_len(len: usize) -> ShmResult<Self> {
        Ok(Self {
            rng: Mutex::new(StdRng::from_entropy()),
            len: check_token_len(len)?,
        })
    }

    /// Deterministic generator, for reproducible tests
    pub fn seeded(seed: u64, len: usize) -> ShmResult<Self> {
        Ok(Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            len: check_token_len(len)?,
        })
    }

    /// Token length produced by [`IdGenerator::generate`]
    pub fn token_len(&self) -> usize {
        self.len
    }

    /// Draw a fresh identifier
    pub fn generate(&self) -> ObjectId {
        let mut rng = self.rng.lock();
        let token: String = (0..self.len)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        ObjectId(token)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").field("len", &self.len).finish()
    }
}

fn check_token_len(len: usize) -> ShmResult<usize> {
    if len == 0 || len > ObjectId::MAX_LEN {
        return Err(ShmError::InvalidIdentifier(format!(
            "token length {len} outside 1..={}",
            ObjectId::MAX_LEN
        )));
    }
    Ok(len)
}

/// Draw one identifier of `len` characters from a fresh generator
pub fn generate_identifier(len: usize) -> ShmResult<ObjectId> {
    Ok(IdGenerator::with_len(len)?.generate())
}
