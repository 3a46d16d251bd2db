use regex::Regex;
use std::sync::OnceLock;

/// Maximum chars fed to an embedding model.
pub const MAX_EMBED_CHARS: usize = 512;
/// Title repetition factor in the combined embedding text.
const TITLE_WEIGHT: usize = 2;

fn html_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

/// Strip markup, drop everything that is not a letter, digit, or whitespace
/// (CJK counts as letters), and collapse runs of whitespace.
pub fn clean_text(text: &str) -> String {
    let stripped = html_tag().replace_all(text, " ");
    let filtered: String = stripped
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Combined article text for embedding: cleaned title repeated for weight,
/// then summary and body, truncated to the model window.
pub fn embedding_text(title: &str, body: &str, summary: &str) -> String {
    let title = clean_text(title);
    let summary = clean_text(summary);
    let body = clean_text(body);

    let mut parts = Vec::new();
    for _ in 0..TITLE_WEIGHT {
        if !title.is_empty() {
            parts.push(title.clone());
        }
    }
    if !summary.is_empty() {
        parts.push(summary);
    }
    if !body.is_empty() {
        parts.push(body);
    }

    truncate_chars(&parts.join(" "), MAX_EMBED_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_and_punctuation() {
        let cleaned = clean_text("<p>삼성전자, 주가 3.5% 급등!</p>");
        assert_eq!(cleaned, "삼성전자 주가 3 5 급등");
    }

    #[test]
    fn title_is_weighted_twice() {
        let text = embedding_text("주가 급등", "본문이다", "요약이다");
        assert_eq!(text.matches("주가 급등").count(), 2);
        assert!(text.ends_with("본문이다"));
    }

    #[test]
    fn truncates_to_window() {
        let long_body = "가".repeat(2000);
        let text = embedding_text("제목", &long_body, "");
        assert_eq!(text.chars().count(), MAX_EMBED_CHARS);
    }

    #[test]
    fn clean_text_is_idempotent() {
        let raw = "  금리   <b>인상</b>?! ";
        let once = clean_text(raw);
        assert_eq!(clean_text(&once), once);
    }
}
