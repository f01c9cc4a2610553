//! Broker channel naming.
//!
//! Channels are addressed by strings of the form `chat:{chat_id}` or
//! `user:{user_id}`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{ChatId, SeqError, UserId};

/// A named pub/sub channel on the broker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Channel {
    /// Every committed message of one chat, positioned by `seq_num`.
    Chat(ChatId),
    /// Per-user notification channel, positioned by a broker counter.
    User(UserId),
}

impl Channel {
    /// The chat this channel carries, if it is a chat channel.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::Chat(id) => Some(*id),
            Self::User(_) => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = SeqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| SeqError::InvalidChannel(s.to_string()))?;
        match kind {
            "chat" => Ok(Self::Chat(id.parse()?)),
            "user" => Ok(Self::User(id.parse()?)),
            _ => Err(SeqError::InvalidChannel(s.to_string())),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_channel_name() {
        let chat = ChatId::new();
        let channel = Channel::Chat(chat);
        assert_eq!(channel.to_string(), format!("chat:{chat}"));
        assert_eq!(channel.to_string().parse::<Channel>().unwrap(), channel);
        assert_eq!(channel.chat_id(), Some(chat));
    }

    #[test]
    fn user_channel_name() {
        let user = UserId::new();
        let channel: Channel = format!("user:{user}").parse().unwrap();
        assert_eq!(channel, Channel::User(user));
        assert_eq!(channel.chat_id(), None);
    }

    #[test]
    fn unknown_prefix_rejected() {
        let err = format!("room:{}", ChatId::new()).parse::<Channel>();
        assert!(matches!(err, Err(SeqError::InvalidChannel(_))));
        assert!("chat".parse::<Channel>().is_err());
        assert!("chat:nope".parse::<Channel>().is_err());
    }

    #[test]
    fn channel_serializes_as_string() {
        let channel = Channel::Chat(ChatId::new());
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, format!("\"{channel}\""));
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, channel);
    }
}
