//! Text extraction for the flat XML bodies STS returns.
//!
//! Only `<Tag>text</Tag>` lookups are needed; no attributes, no namespaces
//! beyond the default one.

/// Text of the first `<tag>` element, entity-unescaped.
pub(crate) fn first_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(unescape(&body[start..end]))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_text_unescapes() {
        let body = "<ErrorResponse><Error><Code>AccessDenied</Code>\
                    <Message>User: a&amp;b is not authorized</Message></Error></ErrorResponse>";
        assert_eq!(first_text(body, "Code").as_deref(), Some("AccessDenied"));
        assert_eq!(
            first_text(body, "Message").as_deref(),
            Some("User: a&b is not authorized")
        );
        assert_eq!(first_text(body, "Missing"), None);
    }
}
