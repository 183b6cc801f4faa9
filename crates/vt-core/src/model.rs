//! Domain types shared by the tracker, the stores and the CLI.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id!(
    /// Stable platform identifier of a user.
    UserId
);
opaque_id!(
    /// Stable platform identifier of a guild.
    GuildId
);
opaque_id!(
    /// Stable platform identifier of a voice channel.
    ChannelId
);

/// Identifier assigned by the session store when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit the state machine tracks: one user inside one guild.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberKey {
    pub user_id: UserId,
    pub guild_id: GuildId,
}

impl MemberKey {
    pub fn new(user_id: impl Into<UserId>, guild_id: impl Into<GuildId>) -> Self {
        Self {
            user_id: user_id.into(),
            guild_id: guild_id.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.guild_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRef {
    pub id: GuildId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub name: String,
}

/// Presence status as reported by the gateway.
///
/// `dnd` and any status this tracker does not know about map to [`Status::Other`],
/// which counts as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Online,
    Idle,
    Invisible,
    Offline,
    Other,
}

impl Status {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Invisible => "invisible",
            Self::Offline => "offline",
            Self::Other => "other",
        }
    }

    /// Statuses that mean the member is away even while connected.
    #[must_use]
    pub const fn is_away(&self) -> bool {
        matches!(self, Self::Idle | Self::Invisible | Self::Offline)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "online" => Self::Online,
            "idle" => Self::Idle,
            "invisible" => Self::Invisible,
            "offline" => Self::Offline,
            _ => Self::Other,
        })
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// Classification of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Active,
    Inactive,
}

impl Classification {
    pub const ALL: [Self; 2] = [Self::Active, Self::Inactive];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("invalid classification: {s}")),
        }
    }
}

/// Output of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    Disconnected,
    Inactive,
    Active,
}

impl Activity {
    /// The session classification this activity is tracked under, if any.
    #[must_use]
    pub const fn classification(&self) -> Option<Classification> {
        match self {
            Self::Disconnected => None,
            Self::Inactive => Some(Classification::Inactive),
            Self::Active => Some(Classification::Active),
        }
    }
}

/// Normalized view of a member as delivered by the gateway.
///
/// Every update carries the member's full current state rather than a delta,
/// which makes replays and duplicates harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub user: UserRef,
    pub guild: GuildRef,
    /// Voice channel the member is connected to, `None` when disconnected.
    #[serde(default)]
    pub channel: Option<ChannelRef>,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub server_mute: bool,
    #[serde(default)]
    pub status: Status,
    /// Whether the member is streaming; picks the duration multiplier.
    #[serde(default)]
    pub is_live: bool,
}

impl MemberState {
    pub fn key(&self) -> MemberKey {
        MemberKey {
            user_id: self.user.id.clone(),
            guild_id: self.guild.id.clone(),
        }
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel.as_ref().map(|channel| &channel.id)
    }
}

/// A session row as stored by a [`SessionStore`](crate::SessionStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub classification: Classification,
    pub is_live: bool,
    pub start_time: DateTime<Utc>,
    /// Calendar day the session is attributed to.
    pub start_date: NaiveDate,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl Session {
    pub fn key(&self) -> MemberKey {
        MemberKey {
            user_id: self.user_id.clone(),
            guild_id: self.guild_id.clone(),
        }
    }

    pub const fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Everything the store needs to create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub classification: Classification,
    pub is_live: bool,
    pub start_time: DateTime<Utc>,
    pub start_date: NaiveDate,
}
