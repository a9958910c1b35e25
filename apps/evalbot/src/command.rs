//! Mention stripping, result formatting and grapheme truncation.
//!
//! Pure functions over a post record and an eval outcome. Facet removal
//! operates on byte offsets of the original text and is applied in
//! descending start order so earlier offsets stay valid; the literal
//! `@handle` form is stripped afterwards, case-insensitively, with
//! trailing whitespace consumed.

use jetstream::{MENTION_FEATURE, PostRecord};
use sandbox::{EvalOutcome, render_value};
use unicode_segmentation::UnicodeSegmentation;

/// Reply posted when a mention carries no code at all.
pub const NO_CODE_REPLY: &str = "No code found in mention";

/// Sentinel for runs that produce neither output nor a value.
pub const NO_OUTPUT_SENTINEL: &str = "✓ (no output)";

/// Extract the code fragment from a mention post.
///
/// Returns `None` when nothing but mention markup remains.
pub fn extract_code(record: &PostRecord, handle: &str, bot_did: &str) -> Option<String> {
    let mut text = strip_mention_facets(record, bot_did);
    text = strip_handle_mentions(&text, handle);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Remove facet-annotated mentions of the bot by byte offset.
fn strip_mention_facets(record: &PostRecord, bot_did: &str) -> String {
    let mut ranges: Vec<(usize, usize)> = record
        .facets
        .iter()
        .filter(|facet| {
            facet.features.iter().any(|feature| {
                feature.feature_type == MENTION_FEATURE
                    && feature.did.as_deref() == Some(bot_did)
            })
        })
        .map(|facet| (facet.index.byte_start, facet.index.byte_end))
        .collect();

    // Descending start order keeps earlier offsets valid while removing.
    ranges.sort_by(|a, b| b.0.cmp(&a.0));

    let mut text = record.text.clone();
    for (start, end) in ranges {
        if start >= end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            // Hostile or stale offsets; leave the text alone.
            continue;
        }
        text.replace_range(start..end, "");
    }
    text
}

/// Remove every literal `@handle`, case-insensitively, together with the
/// whitespace that follows it. Nothing constrains what precedes the `@`.
fn strip_handle_mentions(text: &str, handle: &str) -> String {
    let handle = handle.trim_start_matches('@');
    let needle = format!("@{handle}");
    let needle = needle.as_bytes();
    let bytes = text.as_bytes();

    let mut out = String::with_capacity(text.len());
    let mut index = 0;
    while index < bytes.len() {
        let is_match = bytes.len() - index >= needle.len()
            && bytes[index..index + needle.len()].eq_ignore_ascii_case(needle);
        if is_match {
            index += needle.len();
            while index < bytes.len() {
                let Some(next) = next_char_at(text, index) else { break };
                if !next.is_whitespace() {
                    break;
                }
                index += next.len_utf8();
            }
        } else {
            let Some(ch) = next_char_at(text, index) else { break };
            out.push(ch);
            index += ch.len_utf8();
        }
    }
    out
}

fn next_char_at(text: &str, index: usize) -> Option<char> {
    text.get(index..).and_then(|rest| rest.chars().next())
}

/// Render an eval outcome as reply text.
pub fn format_result(outcome: &EvalOutcome) -> String {
    let value = match &outcome.result {
        Err(error) => return format!("Error: {error}"),
        Ok(value) => value,
    };

    let lines = outcome.output.join("\n");
    let rendered = value.as_ref().map(render_value);
    match (lines.is_empty(), rendered) {
        (true, None) => NO_OUTPUT_SENTINEL.to_string(),
        (true, Some(rendered)) => format!("=> {rendered}"),
        (false, None) => lines,
        (false, Some(rendered)) => format!("{lines}\n=> {rendered}"),
    }
}

/// Truncate to `limit` user-perceived characters (grapheme clusters).
///
/// Over-long text keeps the first `limit - 3` clusters and gains `"..."`.
pub fn truncate_graphemes(text: &str, limit: usize) -> String {
    let mut clusters = text.grapheme_indices(true);
    let Some((cut, _)) = clusters.nth(limit.saturating_sub(3)) else {
        // Fewer than limit - 3 clusters: nothing to do.
        return text.to_string();
    };
    // Within budget when at most 3 clusters remain past the cut.
    if clusters.nth(2).is_none() {
        return text.to_string();
    }
    let mut truncated = text[..cut].to_string();
    truncated.push_str("...");
    truncated
}
