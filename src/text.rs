//! Small text helpers shared by the bridges and front-ends.

/// Chat platforms reject messages past 2000 characters; stay below with room
/// for formatting.
pub const CHAT_MESSAGE_LIMIT: usize = 1900;

/// Shorten `s` to at most `max` bytes, ending in `...` when cut.
///
/// Cuts always land on a `char` boundary, so the result may be a few bytes
/// shorter than `max`.
#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    if max <= 3 {
        return s[..floor_char_boundary(s, max)].to_owned();
    }
    let cut = floor_char_boundary(s, max - 3);
    format!("{}...", &s[..cut])
}

/// Split `s` into chunks of at most `limit` characters.
///
/// An empty input yields a single empty chunk so callers always have
/// something to post.
#[must_use]
pub fn split_message(s: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if s.chars().count() <= limit {
        return vec![s.to_owned()];
    }
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
