use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::Digest;

/// Selectable hash strength. Only the active strength is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashStrength {
    /// 128-bit, the default.
    Bits128,
    Bits160,
    Bits256,
}

impl HashStrength {
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Bits128 => 32,
            Self::Bits160 => 40,
            Self::Bits256 => 64,
        }
    }
}

/// Per-field fingerprints for one article. The full-content hash is the one
/// the store enforces uniqueness on; the others drive annotation paths.
#[derive(Debug, Clone)]
pub struct ArticleHashes {
    pub full_content: String,
    pub title: String,
    pub body: String,
    pub summary: String,
    pub metadata: String,
}

/// Normalizes article text and fingerprints it. Normalization strips HTML,
/// removes punctuation, collapses whitespace, and lowercases; it is
/// idempotent, so hashing is deterministic over re-normalized input.
pub struct ContentHasher {
    strength: HashStrength,
    html_tag: Regex,
    punctuation: Regex,
    whitespace: Regex,
}

impl ContentHasher {
    pub fn new(strength: HashStrength) -> Self {
        Self {
            strength,
            // \w is Unicode-aware: keeps letters, digits, CJK, underscore.
            html_tag: Regex::new(r"<[^>]+>").unwrap(),
            punctuation: Regex::new(r"[^\w\s]").unwrap(),
            whitespace: Regex::new(r"\s+").unwrap(),
        }
    }

    pub fn strength(&self) -> HashStrength {
        self.strength
    }

    /// Normalize content for fingerprinting: HTML strip, punctuation removal,
    /// whitespace collapse, lowercase, trim.
    pub fn normalize(&self, text: &str) -> String {
        let stripped = self.html_tag.replace_all(text, "");
        let depunctuated = self.punctuation.replace_all(&stripped, " ");
        let collapsed = self.whitespace.replace_all(&depunctuated, " ");
        collapsed.trim().to_lowercase()
    }

    /// Hash normalized content at the active strength, hex-encoded.
    pub fn content_hash(&self, content: &str) -> String {
        self.digest(&self.normalize(content))
    }

    /// Canonical article hash per the content invariant:
    /// normalized title, body, and summary joined in that order.
    pub fn article_content_hash(&self, title: &str, body: &str, summary: &str) -> String {
        let combined = format!(
            "{} {} {}",
            self.normalize(title),
            self.normalize(body),
            self.normalize(summary)
        );
        self.digest(combined.trim())
    }

    /// All per-field fingerprints for an article.
    pub fn article_hashes(
        &self,
        external_id: &str,
        title: &str,
        body: &str,
        summary: &str,
        writers: &str,
    ) -> ArticleHashes {
        ArticleHashes {
            full_content: self.article_content_hash(title, body, summary),
            title: self.content_hash(title),
            body: self.content_hash(body),
            summary: self.content_hash(summary),
            metadata: self.digest(&format!("{}{}{}", external_id, title, writers)),
        }
    }

    /// Raw-byte file hash for file-level dedup before parsing.
    /// Always 128-bit: it never leaves the ingest run.
    pub fn file_hash(&self, path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    pub fn raw_hash(&self, bytes: &[u8]) -> String {
        format!("{:x}", md5::compute(bytes))
    }

    /// Check a hex hash against the expected length for the strength.
    pub fn validate(&self, hash: &str) -> bool {
        hash.len() == self.strength.hex_len() && hash.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Positional similarity between two equal-length hex digests.
    /// Diagnostic helper for auditing hash groups; length mismatch scores 0.
    pub fn hash_similarity(&self, a: &str, b: &str) -> f64 {
        match strsim::hamming(a, b) {
            Ok(distance) => {
                let len = a.chars().count();
                if len == 0 {
                    0.0
                } else {
                    1.0 - distance as f64 / len as f64
                }
            }
            Err(_) => 0.0,
        }
    }

    /// Hashes from `pool` scoring at least `threshold` against `target`,
    /// best first.
    pub fn find_similar_hashes(
        &self,
        target: &str,
        pool: &[String],
        threshold: f64,
    ) -> Vec<(String, f64)> {
        let mut matches: Vec<(String, f64)> = pool
            .iter()
            .map(|h| (h.clone(), self.hash_similarity(target, h)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    fn digest(&self, normalized: &str) -> String {
        match self.strength {
            HashStrength::Bits128 => format!("{:x}", md5::compute(normalized.as_bytes())),
            HashStrength::Bits160 => {
                let mut hasher = sha1::Sha1::new();
                hasher.update(normalized.as_bytes());
                hex_encode(&hasher.finalize())
            }
            HashStrength::Bits256 => {
                let mut hasher = sha2::Sha256::new();
                hasher.update(normalized.as_bytes());
                hex_encode(&hasher.finalize())
            }
        }
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(HashStrength::Bits128)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let hasher = ContentHasher::default();
        let raw = "<p>삼성전자,  주가가   <b>급등</b>했다!!</p>";
        let once = hasher.normalize(raw);
        let twice = hasher.normalize(&once);
        assert_eq!(once, twice);
        assert!(!once.contains('<'));
        assert!(!once.contains(','));
    }

    #[test]
    fn identical_content_same_hash() {
        let hasher = ContentHasher::default();
        let a = hasher.article_content_hash("삼성전자 주가 급등", "주가가 급등했다.", "");
        let b = hasher.article_content_hash("삼성전자 주가 급등", "주가가  급등했다!", "");
        assert_eq!(a, b);
    }

    #[test]
    fn html_markup_does_not_change_hash() {
        let hasher = ContentHasher::default();
        let plain = hasher.content_hash("시장이 반등했다");
        let marked = hasher.content_hash("<div>시장이 <em>반등</em>했다</div>");
        assert_eq!(plain, marked);
    }

    #[test]
    fn strengths_produce_expected_lengths() {
        for strength in [
            HashStrength::Bits128,
            HashStrength::Bits160,
            HashStrength::Bits256,
        ] {
            let hasher = ContentHasher::new(strength);
            let hash = hasher.content_hash("코스피 지수");
            assert_eq!(hash.len(), strength.hex_len());
            assert!(hasher.validate(&hash));
        }
    }

    #[test]
    fn article_hashes_cover_each_field() {
        let hasher = ContentHasher::default();
        let hashes = hasher.article_hashes(
            "A-001",
            "삼성전자 주가 급등",
            "주가가 급등했다.",
            "급등 요약",
            "김기자",
        );
        assert!(hasher.validate(&hashes.full_content));
        assert_ne!(hashes.title, hashes.body);
        assert_ne!(hashes.summary, hashes.metadata);
        // Title hash ignores markup, like the content hash.
        let marked = hasher.article_hashes(
            "A-001",
            "<b>삼성전자 주가 급등</b>",
            "주가가 급등했다.",
            "급등 요약",
            "김기자",
        );
        assert_eq!(hashes.title, marked.title);
    }

    #[test]
    fn identical_hashes_score_one() {
        let hasher = ContentHasher::default();
        let h = hasher.content_hash("환율 상승");
        assert_eq!(hasher.hash_similarity(&h, &h), 1.0);
        let other = hasher.content_hash("환율 하락");
        assert!(hasher.hash_similarity(&h, &other) < 1.0);

        let pool = vec![h.clone(), other];
        let similar = hasher.find_similar_hashes(&h, &pool, 0.99);
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0, h);
    }

    #[test]
    fn different_content_different_hash() {
        let hasher = ContentHasher::default();
        assert_ne!(
            hasher.content_hash("금리 인상"),
            hasher.content_hash("금리 인하")
        );
    }
}
