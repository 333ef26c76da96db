//! Newtypes around platform IDs.

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

macro_rules! impl_id {
    ($Id:ident) => {
        impl $Id {
            /// Returns the u64 representation of this Id.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $Id {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl Display for $Id {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                Display::fmt(&self.0, f)
            }
        }

        // Snowflakes travel as strings on the control channel, but some
        // servers have been seen to send bare integers.
        impl Serialize for $Id {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $Id {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Str(String),
                    Num(u64),
                }

                match Raw::deserialize(deserializer)? {
                    Raw::Str(s) => u64::from_str(&s).map(Self).map_err(DeError::custom),
                    Raw::Num(n) => Ok(Self(n)),
                }
            }
        }
    };
}

/// ID of a voice/text channel.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(pub u64);

/// ID of a guild (colloquially, "server").
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GuildId(pub u64);

/// ID of a user.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(pub u64);

impl_id! {ChannelId}
impl_id! {GuildId}
impl_id! {UserId}
