//! Tag scanning shared by SGML (OFX 1.x) and XML (OFX 2.x) documents.
//!
//! Leaf elements in SGML OFX are not closed (`<TRNAMT>-10.00` followed by a
//! newline or the next tag), so values are read up to the next `<` or line
//! break. Matching is ASCII case-insensitive; `to_ascii_uppercase` keeps byte
//! offsets identical, so offsets found in the uppercased copy index the
//! original text.

/// Everything from the `<OFX>` root onwards; the colon header block of SGML
/// files and the XML prolog are dropped.
pub(crate) fn body(content: &str) -> &str {
    let upper = content.to_ascii_uppercase();
    match upper.find("<OFX>") {
        Some(idx) => &content[idx..],
        None => content,
    }
}

/// Contents of every `<tag>` aggregate.
///
/// A block ends at its closing tag; when that is missing it ends at the next
/// opening `<tag>` or at the first of `stop_tags`, whichever comes first.
pub(crate) fn blocks<'a>(content: &'a str, tag: &str, stop_tags: &[&str]) -> Vec<&'a str> {
    let upper = content.to_ascii_uppercase();
    let open = format!("<{}>", tag.to_ascii_uppercase());
    let close = format!("</{}>", tag.to_ascii_uppercase());
    let stops: Vec<String> = stop_tags.iter().map(|t| t.to_ascii_uppercase()).collect();

    let mut found = Vec::new();
    let mut cursor = 0usize;
    while let Some(rel) = upper[cursor..].find(&open) {
        let start = cursor + rel + open.len();
        let rest = &upper[start..];

        let next_open = rest.find(&open);
        let closing = rest.find(&close);
        let end_rel = match (closing, next_open) {
            (Some(c), Some(n)) if c < n => c,
            (Some(c), None) => c,
            (_, Some(n)) => n,
            (None, None) => stops
                .iter()
                .filter_map(|s| rest.find(s.as_str()))
                .min()
                .unwrap_or(rest.len()),
        };
        let end_rel = stops
            .iter()
            .filter_map(|s| rest[..end_rel].find(s.as_str()))
            .min()
            .unwrap_or(end_rel);

        let end = start + end_rel;
        found.push(&content[start..end]);
        cursor = end;
    }

    found
}

pub(crate) fn block<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    blocks(content, tag, &[]).into_iter().next()
}

/// Text of the first `<tag>` leaf element, entity-decoded and trimmed.
/// Empty values read as absent.
pub(crate) fn value(content: &str, tag: &str) -> Option<String> {
    let upper = content.to_ascii_uppercase();
    let needle = format!("<{}>", tag.to_ascii_uppercase());
    let start = upper.find(&needle)? + needle.len();
    let rest = &content[start..];
    let end = rest
        .find(|c: char| c == '<' || c == '\r' || c == '\n')
        .unwrap_or(rest.len());
    let raw = rest[..end].trim();
    if raw.is_empty() {
        None
    } else {
        Some(unescape(raw))
    }
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
