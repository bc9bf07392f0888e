//! Wire-format types exchanged with workers: HTTP request/response bodies
//! and the WebSocket progress protocol. Pure data + parsing, no I/O.

pub mod http;
pub mod ws;

pub use http::{extract_prompt_id, parse_queue_counts, HistoryBody, QueueSnapshot, SubmitRequest, SubmitResponse, ViewQuery};
pub use ws::{parse_ws_message, WsMessage};
