//! Jetstream commit event model.
//!
//! Events arrive as JSON frames of the shape
//! `{did, time_us, kind, commit: {operation, collection, rkey, cid, record}}`.
//! Only `kind = commit` frames carry a commit; identity/account frames are
//! parsed but ignored downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};

/// The post collection the bot subscribes to.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Richtext facet feature identifying a mention.
pub const MENTION_FEATURE: &str = "app.bsky.richtext.facet#mention";

/// One Jetstream frame.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: u64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<Commit>,
}

/// Repo commit carried by a `commit` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub record: Option<Value>,
}

/// An `app.bsky.feed.post` record, reduced to the fields the bot reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<Facet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRefs>,
    #[serde(
        default,
        rename = "createdAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<String>,
}

/// Byte-offset annotation over the post text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facet {
    pub index: ByteSlice,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// Byte range of a facet; offsets index the UTF-8 text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteSlice {
    #[serde(rename = "byteStart")]
    pub byte_start: usize,
    #[serde(rename = "byteEnd")]
    pub byte_end: usize,
}

/// Facet feature. Only mention features carry a `did`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "$type")]
    pub feature_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
}

/// Strong reference to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub uri: String,
    pub cid: String,
}

/// Reply threading refs carried by a post record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRefs {
    pub root: PostRef,
    pub parent: PostRef,
}

/// A post that mentions the bot, ready for evaluation.
///
/// Serializable: this is the queue payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub record: PostRecord,
    pub author_did: String,
    pub post_uri: String,
    pub post_cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root: Option<PostRef>,
    pub received_at: DateTime<Utc>,
}

impl Mention {
    /// Reference to the mention post itself.
    pub fn post_ref(&self) -> PostRef {
        PostRef {
            uri: self.post_uri.clone(),
            cid: self.post_cid.clone(),
        }
    }

    /// Root of the thread the reply must attach to: the existing thread
    /// root when the mention was itself a reply, the mention otherwise.
    pub fn root_ref(&self) -> PostRef {
        self.thread_root.clone().unwrap_or_else(|| self.post_ref())
    }
}

/// Parse one Jetstream JSON frame.
pub fn parse_event(text: &str) -> Result<JetstreamEvent> {
    let event: JetstreamEvent = serde_json::from_str(text)?;
    if event.did.is_empty() {
        return Err(StreamError::Protocol("event missing did".to_string()));
    }
    Ok(event)
}
