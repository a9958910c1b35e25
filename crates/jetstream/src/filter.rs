//! Mention detection over the commit stream.
//!
//! Keeps only post creations that reference the bot, either as the literal
//! `@handle` in the text (ASCII case-insensitive) or as a richtext mention
//! facet carrying the bot's DID.

use chrono::Utc;
use serde_json::Value;
use tracing::trace;

use crate::event::{
    Commit, JetstreamEvent, MENTION_FEATURE, Mention, POST_COLLECTION, PostRecord,
};

/// Filter configured with the bot's identity.
#[derive(Debug, Clone)]
pub struct MentionFilter {
    /// `@handle` needle, including the leading `@`.
    needle: String,
    did: String,
}

impl MentionFilter {
    pub fn new(handle: &str, did: &str) -> Self {
        let handle = handle.trim_start_matches('@');
        Self {
            needle: format!("@{handle}"),
            did: did.to_string(),
        }
    }

    pub fn handle_needle(&self) -> &str {
        &self.needle
    }

    /// Turn a commit event into a `Mention` when it is a post creation
    /// referencing the bot. Returns `None` for everything else.
    pub fn matches(&self, event: &JetstreamEvent) -> Option<Mention> {
        if event.kind != "commit" {
            return None;
        }
        let commit = event.commit.as_ref()?;
        if commit.operation != "create" || commit.collection != POST_COLLECTION {
            return None;
        }
        let record = parse_record(commit)?;
        let cid = commit.cid.clone()?;

        if !self.mentions_bot(&record) {
            return None;
        }

        trace!(author = %event.did, rkey = %commit.rkey, "mention detected");
        Some(Mention {
            post_uri: format!("at://{}/{}/{}", event.did, commit.collection, commit.rkey),
            post_cid: cid,
            author_did: event.did.clone(),
            thread_root: record.reply.as_ref().map(|reply| reply.root.clone()),
            record,
            received_at: Utc::now(),
        })
    }

    fn mentions_bot(&self, record: &PostRecord) -> bool {
        if contains_ascii_ci(&record.text, &self.needle) {
            return true;
        }
        record.facets.iter().any(|facet| {
            facet.features.iter().any(|feature| {
                feature.feature_type == MENTION_FEATURE
                    && feature.did.as_deref() == Some(self.did.as_str())
            })
        })
    }
}

fn parse_record(commit: &Commit) -> Option<PostRecord> {
    let raw: &Value = commit.record.as_ref()?;
    serde_json::from_value(raw.clone()).ok()
}

/// Case-insensitive substring search for an ASCII needle.
///
/// Byte-window comparison is sound here: the needle is ASCII, so a match
/// can never start inside a multi-byte sequence.
fn contains_ascii_ci(haystack: &str, needle: &str) -> bool {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> MentionFilter {
        MentionFilter::new("bot.example", "did:plc:bot")
    }

    fn event(operation: &str, collection: &str, record: Value) -> JetstreamEvent {
        serde_json::from_value(json!({
            "did": "did:plc:author",
            "time_us": 1u64,
            "kind": "commit",
            "commit": {
                "operation": operation,
                "collection": collection,
                "rkey": "3kabc",
                "cid": "bafyreict",
                "record": record
            }
        }))
        .unwrap()
    }

    fn post(text: &str) -> Value {
        json!({"text": text, "createdAt": "2024-01-01T00:00:00Z"})
    }

    #[test]
    fn matches_handle_in_text() {
        let mention = filter()
            .matches(&event("create", POST_COLLECTION, post("@bot.example 2 + 2")))
            .unwrap();
        assert_eq!(mention.author_did, "did:plc:author");
        assert_eq!(
            mention.post_uri,
            "at://did:plc:author/app.bsky.feed.post/3kabc"
        );
        assert_eq!(mention.post_cid, "bafyreict");
        assert!(mention.thread_root.is_none());
    }

    #[test]
    fn handle_match_is_case_insensitive() {
        assert!(filter()
            .matches(&event("create", POST_COLLECTION, post("hey @BOT.Example run this")))
            .is_some());
    }

    #[test]
    fn embedded_handle_still_matches() {
        // Nothing constrains what precedes the `@`.
        assert!(filter()
            .matches(&event("create", POST_COLLECTION, post("foo@bot.example 1")))
            .is_some());
    }

    #[test]
    fn matches_mention_facet_by_did() {
        let record = json!({
            "text": "hey there",
            "facets": [{
                "index": {"byteStart": 0, "byteEnd": 3},
                "features": [{
                    "$type": "app.bsky.richtext.facet#mention",
                    "did": "did:plc:bot"
                }]
            }]
        });
        assert!(filter().matches(&event("create", POST_COLLECTION, record)).is_some());
    }

    #[test]
    fn facet_for_other_did_does_not_match() {
        let record = json!({
            "text": "hey there",
            "facets": [{
                "index": {"byteStart": 0, "byteEnd": 3},
                "features": [{
                    "$type": "app.bsky.richtext.facet#mention",
                    "did": "did:plc:somebody-else"
                }]
            }]
        });
        assert!(filter().matches(&event("create", POST_COLLECTION, record)).is_none());
    }

    #[test]
    fn ignores_irrelevant_commits() {
        let filter = filter();
        assert!(filter
            .matches(&event("delete", POST_COLLECTION, post("@bot.example x")))
            .is_none());
        assert!(filter
            .matches(&event("create", "app.bsky.feed.like", post("@bot.example x")))
            .is_none());
        assert!(filter
            .matches(&event("create", POST_COLLECTION, post("no mention here")))
            .is_none());
    }

    #[test]
    fn reply_carries_thread_root() {
        let record = json!({
            "text": "@bot.example 2 + 2",
            "reply": {
                "root": {"uri": "at://did:plc:op/app.bsky.feed.post/1", "cid": "bafy-root"},
                "parent": {"uri": "at://did:plc:mid/app.bsky.feed.post/2", "cid": "bafy-parent"}
            }
        });
        let mention = filter()
            .matches(&event("create", POST_COLLECTION, record))
            .unwrap();
        assert_eq!(mention.thread_root.unwrap().cid, "bafy-root");
    }

    #[test]
    fn malformed_record_is_skipped() {
        assert!(filter()
            .matches(&event("create", POST_COLLECTION, json!("not an object")))
            .is_none());
    }

    #[test]
    fn missing_cid_is_skipped() {
        let mut event = event("create", POST_COLLECTION, post("@bot.example x"));
        event.commit.as_mut().unwrap().cid = None;
        assert!(filter().matches(&event).is_none());
    }

    #[test]
    fn ascii_ci_search_handles_multibyte_text() {
        assert!(contains_ascii_ci("héllo @Bot.Example ✨", "@bot.example"));
        assert!(!contains_ascii_ci("héllo ✨", "@bot.example"));
        assert!(!contains_ascii_ci("short", "@bot.example"));
    }
}
