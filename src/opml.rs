use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;

/// Maximum nesting depth for OPML outline elements. Caps pathological
/// documents before they exhaust the stack.
const MAX_OPML_DEPTH: usize = 50;

/// Errors from resolving an OPML subscription list.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("failed to fetch list: {0}")]
    Http(#[from] reqwest::Error),

    #[error("list returned HTTP status {0}")]
    Status(u16),

    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// One member of a subscription list: an `<outline>` with an `xmlUrl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub feed_url: String,
    pub title: Option<String>,
}

/// Fetches the list at `list_url` and returns its current member feeds.
///
/// Each call re-fetches and re-parses the document; membership is never
/// cached here. Any failure is the caller's to handle — the reconciliation
/// engine skips the list for the cycle.
pub async fn resolve_members(client: &Client, list_url: &str) -> Result<Vec<ListEntry>, ListError> {
    let response = client.get(list_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ListError::Status(status.as_u16()));
    }
    let body = response.text().await?;
    parse_opml(&body)
}

/// Parses OPML content, collecting every outline element carrying an
/// `xmlUrl` attribute regardless of nesting. Category outlines (no
/// `xmlUrl`) are traversed but not returned.
pub fn parse_opml(content: &str) -> Result<Vec<ListEntry>, ListError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(ListError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(entry) = outline_entry(&e, &reader)? {
                    entries.push(entry);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                if let Some(entry) = outline_entry(&e, &reader)? {
                    entries.push(entry);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ListError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn outline_entry(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<ListEntry>, ListError> {
    let mut feed_url = None;
    let mut title = None;
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| ListError::XmlParse(e.to_string()))?;
        match attr.key.as_ref() {
            b"xmlUrl" => feed_url = Some(value.to_string()),
            b"title" => title = Some(value.to_string()),
            b"text" => text = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(feed_url.map(|feed_url| ListEntry {
        feed_url,
        // `title` is preferred, `text` is the common fallback
        title: title.or(text),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_outlines() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml"/>
      <outline type="rss" text="Other" xmlUrl="https://other.example/rss"/>
    </outline>
  </body>
</opml>"#;

        let entries = parse_opml(content).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].feed_url, "https://example.com/feed.xml");
        assert_eq!(entries[0].title.as_deref(), Some("Example Blog"));
        assert_eq!(entries[1].feed_url, "https://other.example/rss");
        assert_eq!(entries[1].title.as_deref(), Some("Other"));
    }

    #[test]
    fn test_category_outlines_not_returned() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline text="Folder">
    <outline text="Feed" xmlUrl="https://a.example/feed"/>
  </outline>
</body></opml>"#;

        let entries = parse_opml(content).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].feed_url, "https://a.example/feed");
    }

    #[test]
    fn test_missing_title_and_text() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline xmlUrl="https://notitle.example/feed"/>
</body></opml>"#;

        let entries = parse_opml(content).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].title.is_none());
    }

    #[test]
    fn test_empty_opml() {
        let content = r#"<?xml version="1.0"?><opml version="2.0"><body></body></opml>"#;
        let entries = parse_opml(content).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_malformed_xml_error() {
        let result = parse_opml("<not valid xml");
        assert!(matches!(result, Err(ListError::XmlParse(_))));
    }

    #[test]
    fn test_deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let result = parse_opml(&opml);
        assert!(matches!(result, Err(ListError::MaxDepthExceeded(50))));
    }

    #[test]
    fn test_nesting_at_depth_limit_allowed() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..50 {
            opml.push_str(r#"<outline text="level">"#);
        }
        opml.push_str(r#"<outline text="Deep" xmlUrl="https://deep.example/feed"/>"#);
        for _ in 0..50 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let entries = parse_opml(&opml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].feed_url, "https://deep.example/feed");
    }

    #[test]
    fn test_escaped_attribute_values() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline title="A &amp; B" xmlUrl="https://a.example/feed?x=1&amp;y=2"/>
</body></opml>"#;

        let entries = parse_opml(content).unwrap();
        assert_eq!(entries[0].title.as_deref(), Some("A & B"));
        assert_eq!(entries[0].feed_url, "https://a.example/feed?x=1&y=2");
    }

    #[tokio::test]
    async fn test_resolve_members_over_http() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline text="Feed" xmlUrl="https://a.example/feed"/>
</body></opml>"#;
        Mock::given(method("GET"))
            .and(path("/subs.opml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/subs.opml", server.uri());
        let entries = resolve_members(&client, &url).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].feed_url, "https://a.example/feed");
    }

    #[tokio::test]
    async fn test_resolve_members_http_error_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.opml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/gone.opml", server.uri());
        let result = resolve_members(&client, &url).await;
        assert!(matches!(result, Err(ListError::Status(404))));
    }
}
