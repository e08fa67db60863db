//! Frame envelope and message-type ranges.
//!
//! The gateway never interprets frame bodies; the numeric `message_type`
//! alone decides authentication requirements and downstream routing.

/// One application-layer message.
///
/// The compressed flag on the wire is a codec concern: a decoded `Frame`
/// always carries the uncompressed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type; see [`msg`] for the known constants.
    pub message_type: i32,
    /// Sender-assigned sequence, monotonic per sender.
    pub sequence: i64,
    /// Sender timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Opaque payload bytes.
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: i32, sequence: i64, timestamp_ms: i64, body: Vec<u8>) -> Self {
        Self {
            message_type,
            sequence,
            timestamp_ms,
            body,
        }
    }

    /// The class this frame belongs to, derived from its type.
    pub fn class(&self) -> MessageClass {
        MessageClass::of(self.message_type)
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Well-known message-type constants.
pub mod msg {
    // System (1-100)
    pub const HEARTBEAT: i32 = 1;
    pub const LOGIN_REQUEST: i32 = 2;
    pub const LOGIN_RESPONSE: i32 = 3;
    pub const LOGOUT_REQUEST: i32 = 4;
    pub const LOGOUT_RESPONSE: i32 = 5;

    // Player (101-200)
    pub const PLAYER_INFO: i32 = 101;
    pub const PLAYER_MOVE: i32 = 102;
    pub const PLAYER_ATTACK: i32 = 103;

    // Chat (201-300)
    pub const CHAT_PRIVATE: i32 = 201;
    pub const CHAT_WORLD: i32 = 202;
    pub const CHAT_GUILD: i32 = 203;

    // Bag (301-400)
    pub const BAG_INFO: i32 = 301;
    pub const BAG_USE_ITEM: i32 = 302;

    // Battle (401-500)
    pub const BATTLE_START: i32 = 401;
    pub const BATTLE_ACTION: i32 = 402;

    // Guild (501-600)
    pub const GUILD_INFO: i32 = 501;
    pub const GUILD_JOIN: i32 = 502;

    // Activity (601-700)
    pub const ACTIVITY_LIST: i32 = 601;
    pub const ACTIVITY_JOIN: i32 = 602;

    // Errors (9001-9999)
    pub const ERROR_INVALID_REQUEST: i32 = 9001;
    pub const ERROR_UNAUTHORIZED: i32 = 9002;
    pub const ERROR_SERVER_BUSY: i32 = 9003;
    pub const ERROR_INTERNAL: i32 = 9999;
}

/// Numeric-range bucket a message type falls into.
///
/// Classes determine the auth gate (everything except [`MessageClass::System`]
/// requires an authenticated connection) and the downstream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    System,
    Player,
    Chat,
    Bag,
    Battle,
    Guild,
    Activity,
    Payment,
    Error,
    /// Outside every defined range.
    Unknown,
}

impl MessageClass {
    pub fn of(message_type: i32) -> Self {
        match message_type {
            1..=100 => MessageClass::System,
            101..=200 => MessageClass::Player,
            201..=300 => MessageClass::Chat,
            301..=400 => MessageClass::Bag,
            401..=500 => MessageClass::Battle,
            501..=600 => MessageClass::Guild,
            601..=700 => MessageClass::Activity,
            701..=800 => MessageClass::Payment,
            9001..=9999 => MessageClass::Error,
            _ => MessageClass::Unknown,
        }
    }

    /// Whether frames of this class are rejected on unauthenticated
    /// connections.
    pub fn requires_auth(self) -> bool {
        !matches!(self, MessageClass::System)
    }
}
