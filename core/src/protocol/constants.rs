//! Wire constants: frame types, class/method identifiers and reply codes.
//!
//! The numeric identifiers are part of the wire contract and must never change.

/// Handshake bytes a client sends before its first frame.
pub const PROTOCOL_HEADER: [u8; 5] = *b"AMQP\x01";

/// Frame type octets
pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;

/// Every frame is terminated by this octet.
pub const FRAME_END: u8 = 0xCE;

/// type(1) + channel(2) + size(4)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Header plus the trailing end marker.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Smallest frame_max a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Channel 0 carries connection-level methods only.
pub const CONNECTION_CHANNEL: u16 = 0;

/// The single supported SASL-style mechanism.
pub const MECHANISM_PLAIN: &str = "PLAIN";

// Class identifiers
pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 30;
pub const CLASS_QUEUE: u16 = 40;
pub const CLASS_BASIC: u16 = 50;
pub const CLASS_TX: u16 = 60;

// Connection methods
pub const CONNECTION_START: u16 = 10;
pub const CONNECTION_START_OK: u16 = 11;
pub const CONNECTION_OPEN: u16 = 20;
pub const CONNECTION_OPEN_OK: u16 = 21;
pub const CONNECTION_CLOSE: u16 = 30;
pub const CONNECTION_CLOSE_OK: u16 = 31;

// Channel methods
pub const CHANNEL_OPEN: u16 = 10;
pub const CHANNEL_OPEN_OK: u16 = 11;
pub const CHANNEL_FLOW: u16 = 20;
pub const CHANNEL_FLOW_OK: u16 = 21;
pub const CHANNEL_CLOSE: u16 = 30;
pub const CHANNEL_CLOSE_OK: u16 = 31;

// Exchange methods
pub const EXCHANGE_DECLARE: u16 = 10;
pub const EXCHANGE_DECLARE_OK: u16 = 11;
pub const EXCHANGE_DELETE: u16 = 20;
pub const EXCHANGE_DELETE_OK: u16 = 21;
pub const EXCHANGE_BIND: u16 = 30;
pub const EXCHANGE_BIND_OK: u16 = 31;
pub const EXCHANGE_UNBIND: u16 = 40;
pub const EXCHANGE_UNBIND_OK: u16 = 41;

// Queue methods
pub const QUEUE_DECLARE: u16 = 10;
pub const QUEUE_DECLARE_OK: u16 = 11;
pub const QUEUE_BIND: u16 = 20;
pub const QUEUE_BIND_OK: u16 = 21;
pub const QUEUE_UNBIND: u16 = 30;
pub const QUEUE_UNBIND_OK: u16 = 31;
pub const QUEUE_DELETE: u16 = 40;
pub const QUEUE_DELETE_OK: u16 = 41;

// Basic methods
pub const BASIC_CONSUME: u16 = 10;
pub const BASIC_CONSUME_OK: u16 = 11;
pub const BASIC_CANCEL: u16 = 20;
pub const BASIC_CANCEL_OK: u16 = 21;
pub const BASIC_PUBLISH: u16 = 30;
pub const BASIC_RETURN: u16 = 40;
pub const BASIC_DELIVER: u16 = 50;
pub const BASIC_ACK: u16 = 60;
pub const BASIC_NACK: u16 = 70;

// Tx methods
pub const TX_SELECT: u16 = 10;
pub const TX_SELECT_OK: u16 = 11;
pub const TX_COMMIT: u16 = 20;
pub const TX_COMMIT_OK: u16 = 21;
pub const TX_ROLLBACK: u16 = 30;
pub const TX_ROLLBACK_OK: u16 = 31;

// Reply codes
pub const REPLY_SUCCESS: u16 = 200;

// Channel-scoped (soft)
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_ROUTE: u16 = 313;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;

// Connection-scoped (hard)
pub const CONNECTION_FORCED: u16 = 320;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const RESOURCE_ERROR: u16 = 506;
pub const NOT_ALLOWED: u16 = 530;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;
