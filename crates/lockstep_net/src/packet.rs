//! Wire packets.
//!
//! A [`Packet`] is a key plus an opaque payload. The key is a closed
//! enumeration both peers know; any other value is a protocol error.
//! [`Message`] is the typed view of a packet.

use lockstep_core::command::{CommandBatch, PlayerId, Tick};
use lockstep_core::math::{fixed_serde, Fixed};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Payload shape of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkKey {
    /// Handshake.
    Hello = 1,
    /// One player's command batch for one tick.
    Commands = 2,
    /// Clock speed change.
    SpeedChange = 3,
    /// Orderly disconnect.
    Disconnect = 4,
}

impl TryFrom<u8> for NetworkKey {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Hello),
            2 => Ok(Self::Commands),
            3 => Ok(Self::SpeedChange),
            4 => Ok(Self::Disconnect),
            other => Err(NetError::Protocol(format!("unknown network key {other}"))),
        }
    }
}

/// Immutable keyed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    key: NetworkKey,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet from raw parts.
    #[must_use]
    pub const fn new(key: NetworkKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }

    /// Serialize `value` into a packet.
    pub fn encode<T: Serialize>(key: NetworkKey, value: &T) -> Result<Self> {
        Ok(Self::new(key, bincode::serialize(value)?))
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// The key.
    #[must_use]
    pub const fn key(&self) -> NetworkKey {
        self.key
    }

    /// The raw payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Handshake sent by each side right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version.
    pub version: u32,
    /// Sender's player id.
    pub player: PlayerId,
    /// Seed the sender runs with.
    pub seed: u64,
}

/// Clock speed announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedChange {
    /// Sender's tick when the change was made.
    pub tick: Tick,
    /// New multiplier.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
}

/// Orderly disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Human-readable reason.
    pub reason: String,
}

/// Typed view of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake.
    Hello(Hello),
    /// Command batch.
    Commands(CommandBatch),
    /// Speed change.
    SpeedChange(SpeedChange),
    /// Disconnect.
    Disconnect(Disconnect),
}

impl Message {
    /// Key this message travels under.
    #[must_use]
    pub const fn key(&self) -> NetworkKey {
        match self {
            Self::Hello(_) => NetworkKey::Hello,
            Self::Commands(_) => NetworkKey::Commands,
            Self::SpeedChange(_) => NetworkKey::SpeedChange,
            Self::Disconnect(_) => NetworkKey::Disconnect,
        }
    }

    /// Encode into a packet.
    pub fn to_packet(&self) -> Result<Packet> {
        match self {
            Self::Hello(hello) => Packet::encode(self.key(), hello),
            Self::Commands(batch) => Packet::encode(self.key(), batch),
            Self::SpeedChange(change) => Packet::encode(self.key(), change),
            Self::Disconnect(disconnect) => Packet::encode(self.key(), disconnect),
        }
    }

    /// Decode a packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        Ok(match packet.key() {
            NetworkKey::Hello => Self::Hello(packet.decode()?),
            NetworkKey::Commands => Self::Commands(packet.decode()?),
            NetworkKey::SpeedChange => Self::SpeedChange(packet.decode()?),
            NetworkKey::Disconnect => Self::Disconnect(packet.decode()?),
        })
    }
}
