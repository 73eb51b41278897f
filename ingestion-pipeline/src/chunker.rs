/// Window size in whitespace tokens.
pub const CHUNK_SIZE: usize = 512;
/// Tokens shared between consecutive windows.
pub const CHUNK_OVERLAP: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub token_count: u32,
}

/// Splits normalized content into overlapping token windows.
///
/// Empty input yields no chunks; anything shorter than one window yields
/// exactly one chunk. Windows advance by `CHUNK_SIZE - CHUNK_OVERLAP` tokens
/// so neighbouring chunks share context.
pub fn chunk_text(content: &str) -> Vec<Chunk> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let stride = CHUNK_SIZE - CHUNK_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0u32;

    loop {
        let end = (start + CHUNK_SIZE).min(tokens.len());
        let window = &tokens[start..end];
        chunks.push(Chunk {
            index,
            text: window.join(" "),
            token_count: window.len() as u32,
        });

        if end == tokens.len() {
            break;
        }
        start += stride;
        index += 1;
    }

    chunks
}

/// Strips lightweight markup (markdown markers, inline HTML, links) down to
/// plain text and collapses runs of whitespace.
pub fn normalize_content(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut in_tag = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            '#' | '*' | '`' | '_' | '~' => {}
            '[' => {
                // Markdown link: keep the label, drop the target.
                let mut label = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    label.push(inner);
                }
                text.push_str(&label);
                if closed && chars.peek() == Some(&'(') {
                    chars.next();
                    for inner in chars.by_ref() {
                        if inner == ')' {
                            break;
                        }
                    }
                }
            }
            _ => text.push(c),
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n\t ").is_empty());
    }

    #[test]
    fn short_input_yields_exactly_one_chunk() {
        let chunks = chunk_text(&words(12));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].token_count, 12);
    }

    #[test]
    fn input_of_exactly_one_window_stays_one_chunk() {
        let chunks = chunk_text(&words(CHUNK_SIZE));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, CHUNK_SIZE as u32);
    }

    #[test]
    fn long_input_overlaps_by_fifty_tokens() {
        let chunks = chunk_text(&words(CHUNK_SIZE + 1));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].token_count, CHUNK_SIZE as u32);
        // Second window starts at stride 462 and runs to token 513.
        assert_eq!(chunks[1].token_count, (CHUNK_OVERLAP + 1) as u32);
        assert_eq!(chunks[1].index, 1);

        let first_tokens: Vec<&str> = chunks[0].text.split_whitespace().collect();
        let second_tokens: Vec<&str> = chunks[1].text.split_whitespace().collect();
        assert_eq!(
            &first_tokens[CHUNK_SIZE - CHUNK_OVERLAP..],
            &second_tokens[..CHUNK_OVERLAP]
        );
    }

    #[test]
    fn chunk_indexes_are_contiguous_from_zero() {
        let chunks = chunk_text(&words(CHUNK_SIZE * 3));
        let indexes: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        let expected: Vec<u32> = (0..chunks.len() as u32).collect();
        assert_eq!(indexes, expected);
    }

    #[test]
    fn normalize_strips_markdown_and_html() {
        let raw = "# Reset the VPN\n\nUse the **admin** console, then run `vpnctl restart`.\n<p>Contact [support](https://example.com/help) if it fails.</p>";
        assert_eq!(
            normalize_content(raw),
            "Reset the VPN Use the admin console, then run vpnctl restart. Contact support if it fails."
        );
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_content("a\n\n\nb   c\t\td"), "a b c d");
    }

    #[test]
    fn normalize_keeps_plain_text_intact() {
        assert_eq!(
            normalize_content("restart the gateway at 08:00"),
            "restart the gateway at 08:00"
        );
    }
}
