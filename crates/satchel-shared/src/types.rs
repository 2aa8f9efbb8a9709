use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map(Self)
            }
        }
    };
}

row_id!(
    /// Internal row id of a stored blob. Never exposed in URLs; see
    /// [`crate::HandleCodec`].
    BlobId
);
row_id!(
    /// Row id of a message (sent or received email).
    MessageId
);
row_id!(
    /// Account id of a mailbox owner.
    UserId
);

/// Why a user can see a blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Uploaded from the compose form, not yet attached to a sent message.
    Pending,
    /// Attached to a message the user sent.
    Sender,
    /// Attached to a message the user received and owns a copy of.
    Recipient,
}

/// What a deletion-queue item reclaims.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemKind {
    Message,
    Blob,
}

/// Lifecycle of a deletion-queue item.
///
/// `Pending -> Processing -> Completed`, or back to `Pending` for a retry,
/// or to the terminal `Failed` once the attempt ceiling is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

text_enum!(GrantKind {
    Pending => "pending",
    Sender => "sender",
    Recipient => "recipient",
});

text_enum!(QueueItemKind {
    Message => "message",
    Blob => "blob",
});

text_enum!(QueueStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl GrantKind {
    /// Grants created at send time are tied to a message.
    pub fn is_message_bound(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
