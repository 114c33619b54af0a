use std::fmt;
use std::str::FromStr;

use uuid::{Uuid, Variant, Version};

use crate::error::{FrameError, Result};

/// Length of an identifier on the wire.
pub const ID_LEN: usize = 16;

/// Correlation identifier carried by every frame.
///
/// Locally generated identifiers are random version-4 UUIDs. Identifiers read
/// off the wire are taken as raw bytes; [`Identifier::from_v4_bytes`] applies
/// the version and variant check for callers that want it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap raw wire bytes without validation.
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Wrap raw bytes, requiring the version-4 and RFC 4122 variant bits.
    pub fn from_v4_bytes(bytes: [u8; ID_LEN]) -> Result<Self> {
        let id = Self::from_bytes(bytes);
        if id.is_v4() {
            Ok(id)
        } else {
            Err(FrameError::InvalidIdentifier(id.to_string()))
        }
    }

    /// The 16 wire bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }

    pub fn is_v4(&self) -> bool {
        self.0.get_version() == Some(Version::Random) && self.0.get_variant() == Variant::RFC4122
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.0.hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| FrameError::InvalidIdentifier(s.to_string()))
    }
}
