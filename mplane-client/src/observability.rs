//! Event-name constants for structured tracing emitted by this crate.
//!
//! Library code emits events/spans and does not unconditionally initialize a
//! global subscriber. Binaries and tests are responsible for one-time
//! `tracing_subscriber` initialization at process boundaries.

pub(crate) mod events {
    pub const RENDEZVOUS_OPEN: &str = "rendezvous_open";
    pub const RENDEZVOUS_TIMEOUT: &str = "rendezvous_timeout";
    pub const RENDEZVOUS_CLOSE_FAILED: &str = "rendezvous_close_failed";
    pub const RENDEZVOUS_EXTRA_REPLY_DROPPED: &str = "rendezvous_extra_reply_dropped";

    pub const DIRECTORY_EMPTY: &str = "directory_empty";
    pub const DIRECTORY_ID_MISMATCH: &str = "directory_id_mismatch";

    pub const RECEIPT_TIMEOUT: &str = "receipt_timeout";
    pub const RECEIPT_UNUSABLE: &str = "receipt_unusable";
    pub const LIFECYCLE_TERMINAL: &str = "lifecycle_terminal";

    pub const RESULT_WORKER_UP: &str = "result_worker_up";
    pub const RESULT_WORKER_DOWN: &str = "result_worker_down";
    pub const RESULT_QUEUE_FULL: &str = "result_queue_full";
    pub const RESULT_DECODE_FAILED: &str = "result_decode_failed";
    pub const RESULT_DROPPED: &str = "result_dropped";
    pub const RESULT_EOF: &str = "result_eof";
    pub const STREAM_CLOSE_FAILED: &str = "stream_close_failed";
}
