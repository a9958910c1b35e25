//! Jetstream firehose subscription and mention detection.
//!
//! This crate intentionally exposes a small surface:
//! - a websocket subscription to the commit stream with reconnect signals
//! - the commit event / post record model
//! - the mention filter that emits `Mention` records for the worker

pub mod error;
pub mod event;
pub mod filter;
pub mod stream;

pub use error::{Result, StreamError};
pub use event::{
    ByteSlice, Commit, Facet, Feature, JetstreamEvent, MENTION_FEATURE, Mention, POST_COLLECTION,
    PostRecord, PostRef, ReplyRefs,
};
pub use filter::MentionFilter;
pub use stream::{ConnectionState, JetstreamConfig, JetstreamConnection, StreamSignal};
