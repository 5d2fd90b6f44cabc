//! Protocol constants and default tunables

/// Default FreeSWITCH event socket port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Default target address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8021";

/// Default event socket password shipped with FreeSWITCH
pub const DEFAULT_PASSWORD: &str = "ClueCon";

/// Socket read chunk size (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Receive buffer allocation size, also the minimum growth increment
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message size (8MB), checked against Content-Length
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum bytes held unparsed before the stream is considered desynchronized
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Outbound line terminator
pub const LINE_TERMINATOR: &str = "\r\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Header names
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
pub const HEADER_EVENT_NAME: &str = "Event-Name";
pub const HEADER_UNIQUE_ID: &str = "Unique-ID";
pub const HEADER_CALLER_UUID: &str = "Caller-Unique-ID";
pub const HEADER_JOB_UUID: &str = "Job-UUID";

/// Pseudo-field holding an event's length-delimited payload
pub const EVENT_BODY_FIELD: &str = "body";

/// Exact Reply-Text the switch sends when `auth` is accepted
pub const AUTH_ACCEPTED: &str = "+OK accepted";

/// Reply prefixes
pub const REPLY_OK_PREFIX: &str = "+OK";
pub const REPLY_ERR_PREFIX: &str = "-ERR";

/// TCP dial timeout (also bounds each handshake read)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Fixed backoff between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Bounded wait for room in a full event channel before dropping
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 1000;

/// Maximum number of queued events before the dispatcher starts waiting
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;
