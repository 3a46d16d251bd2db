use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use uuid::Uuid;

use crate::error::ParseError;
use crate::ingest::hasher::ContentHasher;
use crate::types::{ArticleImage, ArticleRecord, Category, Keyword, KeywordKind};

/// Parses one XML feed document into an [`ArticleRecord`].
///
/// The walker targets the concrete feed shape (an `article` element holding
/// `wms_article`, body/summary CDATA blocks, category rows, images, stock
/// codes, and keywords). Unknown elements are ignored; CDATA is treated as
/// text; missing optional fields become null.
pub struct ArticleParser {
    hasher: ContentHasher,
    html_tag: Regex,
}

impl ArticleParser {
    pub fn new(hasher: ContentHasher) -> Self {
        Self {
            hasher,
            html_tag: Regex::new(r"<[^>]+>").unwrap(),
        }
    }

    /// Parse raw document bytes. Aside from ingest provenance timestamps, the
    /// output is a pure function of the input bytes: the internal id is
    /// derived from the external id, and the content hash from normalized
    /// content, so identical bytes always map to the same record identity.
    pub fn parse(&self, bytes: &[u8]) -> Result<ArticleRecord, ParseError> {
        let root = build_tree(bytes)?;
        let article = find_article(&root).ok_or(ParseError::MissingArticle)?;

        let wms_article = article.child("wms_article");
        let external_id = wms_article
            .and_then(|n| n.text_of("art_id"))
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingIdentity)?;

        let title = wms_article
            .and_then(|n| self.clean_text(n, "title"))
            .unwrap_or_default();
        let subtitle = wms_article.and_then(|n| self.clean_text(n, "sub_title"));
        let body = article
            .child("wms_article_body")
            .and_then(|n| self.clean_text(n, "body"))
            .unwrap_or_default();
        let summary = article
            .child("wms_article_summary")
            .and_then(|n| self.clean_text(n, "summary"));

        let publish_time = wms_article.and_then(|n| self.datetime_of(n, "service_daytime"));
        let registered_time = wms_article.and_then(|n| self.datetime_of(n, "reg_dt"));
        let modified_time = wms_article.and_then(|n| self.datetime_of(n, "mod_dt"));
        let article_year = wms_article.and_then(|n| self.int_of(n, "art_year"));

        let categories = article
            .child("wms_code_classes")
            .map(|n| self.parse_categories(n))
            .unwrap_or_default();
        let images = article
            .child("wms_article_images")
            .map(|n| self.parse_images(n))
            .unwrap_or_default();
        let stock_codes = article
            .child("stock_codes")
            .map(|n| split_comma(&n.text))
            .unwrap_or_default();
        let keywords = article
            .child("wms_article_keywords")
            .map(|n| split_comma(&n.text))
            .unwrap_or_default()
            .into_iter()
            .map(|keyword| Keyword {
                keyword,
                kind: KeywordKind::General,
            })
            .collect();

        let content_hash = self.hasher.article_content_hash(
            &title,
            &body,
            summary.as_deref().unwrap_or(""),
        );

        Ok(ArticleRecord {
            id: internal_id(&external_id),
            external_id,
            title,
            subtitle,
            body,
            summary,
            writers: wms_article.and_then(|n| self.clean_text(n, "writers")),
            publish_time,
            registered_time,
            modified_time,
            source_url: article.child("article_url").map(|n| self.strip_html(&n.text)),
            media_code: wms_article.and_then(|n| n.text_of("media_code")),
            edition: wms_article.and_then(|n| n.text_of("pub_edition")),
            section: wms_article.and_then(|n| n.text_of("pub_section")),
            page: wms_article.and_then(|n| n.text_of("pub_page")),
            article_year,
            categories,
            keywords,
            stock_codes,
            images,
            content_hash,
            ingested_at: Utc::now(),
            is_embedded: false,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        })
    }

    pub fn parse_file(&self, path: &std::path::Path) -> Result<ArticleRecord, ParseError> {
        let bytes =
            std::fs::read(path).map_err(|e| ParseError::Malformed(format!("read failed: {}", e)))?;
        self.parse(&bytes)
    }

    fn parse_categories(&self, node: &XmlNode) -> Vec<Category> {
        node.children_named("wms_code_class")
            .map(|class| Category {
                code_id: class.text_of("code_id"),
                code_nm: class.text_of("code_nm"),
                large_code_id: class.text_of("large_code_id"),
                large_code_nm: class.text_of("large_code_nm"),
                middle_code_id: class.text_of("middle_code_id"),
                middle_code_nm: class.text_of("middle_code_nm"),
                small_code_id: class.text_of("small_code_id"),
                small_code_nm: class.text_of("small_code_nm"),
            })
            .collect()
    }

    fn parse_images(&self, node: &XmlNode) -> Vec<ArticleImage> {
        node.children_named("wms_article_image")
            .map(|image| ArticleImage {
                image_url: image.text_of("image_url"),
                image_caption: image.child("image_caption").map(|n| self.strip_html(&n.text)),
            })
            .collect()
    }

    /// Child text with HTML markup stripped (CDATA bodies carry markup).
    fn clean_text(&self, node: &XmlNode, name: &str) -> Option<String> {
        node.child(name)
            .map(|n| self.strip_html(&n.text))
            .filter(|s| !s.is_empty())
    }

    fn strip_html(&self, text: &str) -> String {
        self.html_tag.replace_all(text, "").trim().to_string()
    }

    /// Lenient integer field: unparseable values become null.
    fn int_of(&self, node: &XmlNode, name: &str) -> Option<i32> {
        node.text_of(name).and_then(|s| s.parse().ok())
    }

    /// Lenient datetime field: a value that matches none of the accepted
    /// formats is logged and treated as null.
    fn datetime_of(&self, node: &XmlNode, name: &str) -> Option<DateTime<Utc>> {
        let text = node.text_of(name)?;
        match parse_datetime(&text) {
            Ok(dt) => Some(dt),
            Err(err) => {
                tracing::debug!(field = name, value = %text, %err, "dropping unparseable date");
                None
            }
        }
    }
}

/// Accepted feed formats: `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, `YYYYMMDDHHMMSS`.
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>, ParseError> {
    let text = text.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }
    Err(ParseError::UnparseableDate(text.to_string()))
}

/// Internal ids are minted deterministically from the external id so that
/// re-parsing the same document never creates a second identity.
fn internal_id(external_id: &str) -> Uuid {
    let digest = md5::compute(external_id.as_bytes());
    Uuid::from_bytes(digest.0)
}

fn split_comma(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Minimal element tree: name, accumulated text (entity-decoded, CDATA
/// inlined), and ordered children. Attributes are not part of the feed schema
/// and are ignored.
struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(name: String) -> Self {
        Self {
            name,
            text: String::new(),
            children: Vec::new(),
        }
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn text_of(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn build_tree(bytes: &[u8]) -> Result<XmlNode, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack = vec![XmlNode::new(String::new())];

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(XmlNode::new(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::new(name));
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                let raw = t.into_inner();
                let text = std::str::from_utf8(&raw)
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(text);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err(ParseError::Malformed("unbalanced end tag".to_string()));
                }
                if let Some(node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(ParseError::Malformed("unclosed element".to_string()));
    }
    Ok(stack.remove(0))
}

/// Depth-first search for the first `article` element.
fn find_article(node: &XmlNode) -> Option<&XmlNode> {
    if node.name == "article" {
        return Some(node);
    }
    node.children.iter().find_map(find_article)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<newsml>
  <article>
    <action>insert</action>
    <wms_article>
      <art_id>A-001</art_id>
      <art_year>2024</art_year>
      <title><![CDATA[삼성전자 주가 급등]]></title>
      <writers><![CDATA[김기자]]></writers>
      <service_daytime>2024-03-15 09:30:00</service_daytime>
      <reg_dt>20240315093000</reg_dt>
      <pub_section>증권면</pub_section>
      <media_code>mk</media_code>
    </wms_article>
    <wms_article_body>
      <body><![CDATA[<p>삼성전자 주가가 급등했다.</p>]]></body>
    </wms_article_body>
    <wms_article_summary>
      <summary><![CDATA[삼성전자 주가 급등 요약]]></summary>
    </wms_article_summary>
    <wms_code_classes>
      <wms_code_class>
        <code_id>S01</code_id>
        <large_code_nm><![CDATA[증권]]></large_code_nm>
      </wms_code_class>
    </wms_code_classes>
    <wms_article_images>
      <wms_article_image>
        <image_url>http://img.example.com/a.jpg</image_url>
        <image_caption><![CDATA[차트]]></image_caption>
      </wms_article_image>
    </wms_article_images>
    <stock_codes>005930</stock_codes>
    <wms_article_keywords>주가, 반도체</wms_article_keywords>
    <article_url><![CDATA[http://news.example.com/A-001]]></article_url>
    <unknown_future_field>ignored</unknown_future_field>
  </article>
</newsml>"#;

    fn parser() -> ArticleParser {
        ArticleParser::new(ContentHasher::default())
    }

    #[test]
    fn parses_sample_article() {
        let record = parser().parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(record.external_id, "A-001");
        assert_eq!(record.title, "삼성전자 주가 급등");
        assert_eq!(record.body, "삼성전자 주가가 급등했다.");
        assert_eq!(record.summary.as_deref(), Some("삼성전자 주가 급등 요약"));
        assert_eq!(record.article_year, Some(2024));
        assert_eq!(record.categories.len(), 1);
        assert_eq!(record.categories[0].large_code_nm.as_deref(), Some("증권"));
        assert_eq!(record.stock_codes, vec!["005930"]);
        assert_eq!(record.keywords.len(), 2);
        assert_eq!(record.keywords[0].keyword, "주가");
        assert_eq!(record.images.len(), 1);
        assert_eq!(
            record.source_url.as_deref(),
            Some("http://news.example.com/A-001")
        );
        assert!(!record.content_hash.is_empty());
    }

    #[test]
    fn parse_is_deterministic() {
        let a = parser().parse(SAMPLE.as_bytes()).unwrap();
        let b = parser().parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.title, b.title);
    }

    #[test]
    fn datetime_formats_accepted() {
        let record = parser().parse(SAMPLE.as_bytes()).unwrap();
        let publish = record.publish_time.unwrap();
        assert_eq!(publish.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-15 09:30:00");
        // reg_dt used the compact format
        assert_eq!(record.registered_time.unwrap(), publish);
    }

    #[test]
    fn date_only_format_accepted() {
        let dt = parse_datetime("2024-03-15").unwrap();
        assert_eq!(dt.format("%H:%M:%S").to_string(), "00:00:00");
        assert!(parse_datetime("tomorrow-ish").is_err());
    }

    #[test]
    fn missing_article_element_rejected() {
        let err = parser().parse(b"<newsml><other/></newsml>").unwrap_err();
        assert!(matches!(err, ParseError::MissingArticle));
    }

    #[test]
    fn missing_identity_rejected() {
        let xml = "<newsml><article><wms_article><title>t</title></wms_article></article></newsml>";
        let err = parser().parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::MissingIdentity));
    }

    #[test]
    fn malformed_xml_rejected() {
        let err = parser().parse(b"<newsml><article>").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn unparseable_year_becomes_null() {
        let xml = SAMPLE.replace("<art_year>2024</art_year>", "<art_year>n/a</art_year>");
        let record = parser().parse(xml.as_bytes()).unwrap();
        assert_eq!(record.article_year, None);
    }
}
