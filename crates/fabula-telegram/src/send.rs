//! Text helpers for outbound Telegram messages.

/// Single-message size cap, a few characters under Telegram's 4096 limit.
pub const CHUNK_MAX: usize = 4090;

/// Characters the MarkdownV2 parser treats as markup. Any of these left
/// unescaped in literal text makes the API reject the whole message.
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Backslash-escape every reserved MarkdownV2 character in `text`.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Trim a body to the single-message limit, marking the cut. Narrative
/// fragments are authored well under the limit; this is the guard rail for
/// user-generated or concatenated content.
pub fn clamp_message(text: &str) -> String {
    if text.len() <= CHUNK_MAX {
        return text.to_string();
    }
    let mut end = CHUNK_MAX - 1;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let cut = text[..end].rfind(char::is_whitespace).unwrap_or(end);
    format!("{}…", &text[..cut])
}
