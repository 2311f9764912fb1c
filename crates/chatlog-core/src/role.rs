use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Logical category of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Message,
    Contact,
    Image,
    Video,
    File,
    Voice,
    Session,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Message,
        Role::Contact,
        Role::Image,
        Role::Video,
        Role::File,
        Role::Voice,
        Role::Session,
    ];

    /// Subdirectory of the storage root that holds files of this role in the
    /// directory-per-role layout. Voice shards live next to message shards.
    #[must_use]
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Message | Self::Voice => "message",
            Self::Contact => "contact",
            Self::Image | Self::Video | Self::File => "hardlink",
            Self::Session => "session",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Contact => "contact",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == needle)
            .ok_or_else(|| CoreError::UnknownRole(s.to_string()))
    }
}
