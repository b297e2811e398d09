/// Telegram rejects message texts longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Escape text for Telegram's HTML parse mode.
///
/// Telegram only requires `<`, `>` and `&` to be replaced; quotes are left
/// alone because they never appear inside tags we emit.
pub fn escape_html(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + input.len() / 8);
    for ch in input.chars() {
        match ch {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(ch),
        }
    }
    result
}

/// Cut already-escaped HTML text to at most `max_chars` characters without
/// leaving half an entity (`&am`) at the end.
pub fn truncate_html(input: &str, max_chars: usize) -> String {
    let Some((cut, _)) = input.char_indices().nth(max_chars) else {
        return input.to_string();
    };

    let mut truncated = &input[..cut];
    if let Some(amp) = truncated.rfind('&')
        && !truncated[amp..].contains(';')
    {
        truncated = &truncated[..amp];
    }
    truncated.to_string()
}

/// Reverse of the markup we emit: drop tags and decode the escaped
/// characters, for sending the same text without a parse mode.
pub fn html_to_plain(input: &str) -> String {
    let mut stripped = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => stripped.push(ch),
            _ => {}
        }
    }
    stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
