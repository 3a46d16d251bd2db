use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    ArticleImage, ArticleRecord, ArticleType, Category, EmbeddingRecord, EntityBuckets,
    IndexState, Keyword, KeywordKind, LogStatus, MetadataRecord, Phase, ProcessingLogEntry,
};

const ARTICLE_COLUMNS: &str = "id, external_id, title, subtitle, body, summary, writers, \
     publish_time, registered_time, modified_time, source_url, media_code, edition, section, \
     page, article_year, content_hash, ingested_at, is_embedded, embedding_model, embedded_at, \
     processing_error, similar_to";

/// Transactional record store: one table per entity class, an append-only
/// processing log, and the keyword-candidate fetch used by the lexical side
/// of retrieval. Single statements are atomic; multi-row operations run in
/// explicit transactions. Uniqueness on `external_id` and `content_hash`
/// turns duplicate inserts into [`StoreError::Conflict`].
pub struct ArticleStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_articles: u64,
    pub embedded_articles: u64,
    pub errored_articles: u64,
    pub recent_articles: u64,
    pub total_vectors: u64,
}

impl ArticleStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Permanent(format!("create store dir: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests and throwaway runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                subtitle TEXT,
                body TEXT NOT NULL,
                summary TEXT,
                writers TEXT,
                publish_time TEXT,
                registered_time TEXT,
                modified_time TEXT,
                source_url TEXT,
                media_code TEXT,
                edition TEXT,
                section TEXT,
                page TEXT,
                article_year INTEGER,
                content_hash TEXT NOT NULL UNIQUE,
                ingested_at TEXT NOT NULL,
                is_embedded INTEGER NOT NULL DEFAULT 0,
                embedding_model TEXT,
                embedded_at TEXT,
                processing_error TEXT,
                similar_to TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_articles_hash ON articles(content_hash);
            CREATE INDEX IF NOT EXISTS idx_articles_publish ON articles(publish_time);
            CREATE INDEX IF NOT EXISTS idx_articles_embedded ON articles(is_embedded);

            CREATE TABLE IF NOT EXISTS article_metadata (
                article_id TEXT PRIMARY KEY REFERENCES articles(id) ON DELETE CASCADE,
                article_type TEXT NOT NULL,
                importance_score REAL NOT NULL,
                indexing_text TEXT NOT NULL,
                metadata_hash TEXT NOT NULL,
                content_length INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                has_images INTEGER NOT NULL,
                has_stock_codes INTEGER NOT NULL,
                entities TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS article_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                code_id TEXT, code_nm TEXT,
                large_code_id TEXT, large_code_nm TEXT,
                middle_code_id TEXT, middle_code_nm TEXT,
                small_code_id TEXT, small_code_nm TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_categories_article ON article_categories(article_id);

            CREATE TABLE IF NOT EXISTS article_keywords (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                keyword_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_keywords_article ON article_keywords(article_id);
            CREATE INDEX IF NOT EXISTS idx_keywords_keyword ON article_keywords(keyword);

            CREATE TABLE IF NOT EXISTS article_stock_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                stock_code TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stock_codes_article ON article_stock_codes(article_id);

            CREATE TABLE IF NOT EXISTS article_images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                image_url TEXT,
                image_caption TEXT
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                article_id TEXT NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                vector TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                model_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (article_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS index_states (
                name TEXT PRIMARY KEY,
                provider_index_id TEXT,
                endpoint_id TEXT,
                deployed_id TEXT,
                dimensions INTEGER NOT NULL,
                distance TEXT NOT NULL,
                total_vectors INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT,
                active INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS processing_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT,
                phase TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                duration_ms INTEGER,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_timestamp ON processing_log(timestamp);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist one article with its derived metadata and child rows in a
    /// single transaction. Unique violations surface as `Conflict`.
    pub fn insert_article(
        &self,
        article: &ArticleRecord,
        metadata: &MetadataRecord,
    ) -> Result<Uuid, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "INSERT INTO articles ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                 ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                ARTICLE_COLUMNS
            ),
            params![
                article.id.to_string(),
                article.external_id,
                article.title,
                article.subtitle,
                article.body,
                article.summary,
                article.writers,
                article.publish_time.map(|t| t.to_rfc3339()),
                article.registered_time.map(|t| t.to_rfc3339()),
                article.modified_time.map(|t| t.to_rfc3339()),
                article.source_url,
                article.media_code,
                article.edition,
                article.section,
                article.page,
                article.article_year,
                article.content_hash,
                article.ingested_at.to_rfc3339(),
                article.is_embedded as i64,
                article.embedding_model,
                article.embedded_at.map(|t| t.to_rfc3339()),
                article.processing_error,
                article.similar_to.map(|id| id.to_string()),
            ],
        )?;

        let entities_json = serde_json::to_string(&metadata.entities)
            .map_err(|e| StoreError::Permanent(format!("serialize entities: {}", e)))?;
        tx.execute(
            "INSERT INTO article_metadata (article_id, article_type, importance_score, \
             indexing_text, metadata_hash, content_length, word_count, has_images, \
             has_stock_codes, entities) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                article.id.to_string(),
                metadata.article_type.as_str(),
                metadata.importance_score,
                metadata.indexing_text,
                metadata.metadata_hash,
                metadata.content_length as i64,
                metadata.word_count as i64,
                metadata.has_images as i64,
                metadata.has_stock_codes as i64,
                entities_json,
            ],
        )?;

        for category in &article.categories {
            tx.execute(
                "INSERT INTO article_categories (article_id, code_id, code_nm, large_code_id, \
                 large_code_nm, middle_code_id, middle_code_nm, small_code_id, small_code_nm) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    article.id.to_string(),
                    category.code_id,
                    category.code_nm,
                    category.large_code_id,
                    category.large_code_nm,
                    category.middle_code_id,
                    category.middle_code_nm,
                    category.small_code_id,
                    category.small_code_nm,
                ],
            )?;
        }

        for keyword in &article.keywords {
            tx.execute(
                "INSERT INTO article_keywords (article_id, keyword, keyword_type) VALUES (?1, ?2, ?3)",
                params![article.id.to_string(), keyword.keyword, keyword.kind.as_str()],
            )?;
        }
        // Typed entity rows let keyword search match on entity kind.
        for (entity, kind) in metadata.entities.iter_all() {
            tx.execute(
                "INSERT INTO article_keywords (article_id, keyword, keyword_type) VALUES (?1, ?2, ?3)",
                params![article.id.to_string(), entity, kind.as_str()],
            )?;
        }

        for code in &article.stock_codes {
            tx.execute(
                "INSERT INTO article_stock_codes (article_id, stock_code) VALUES (?1, ?2)",
                params![article.id.to_string(), code],
            )?;
        }

        for image in &article.images {
            tx.execute(
                "INSERT INTO article_images (article_id, image_url, image_caption) VALUES (?1, ?2, ?3)",
                params![article.id.to_string(), image.image_url, image.image_caption],
            )?;
        }

        tx.commit()?;
        Ok(article.id)
    }

    pub fn mark_embedded(&self, id: Uuid, model_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE articles SET is_embedded = 1, embedding_model = ?2, embedded_at = ?3 \
             WHERE id = ?1",
            params![id.to_string(), model_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_error(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE articles SET processing_error = ?2 WHERE id = ?1 AND processing_error IS NULL",
            params![id.to_string(), message],
        )?;
        Ok(())
    }

    /// Store a batch of chunk vectors and flip the embedded flag in one
    /// transaction, so the state transition and its evidence commit together.
    pub fn commit_embeddings(
        &self,
        article_id: Uuid,
        records: &[EmbeddingRecord],
        model_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            let vector_json = serde_json::to_string(&record.vector)
                .map_err(|e| StoreError::Permanent(format!("serialize vector: {}", e)))?;
            tx.execute(
                "INSERT OR REPLACE INTO embeddings (article_id, chunk_index, vector, text_hash, \
                 model_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.article_id.to_string(),
                    record.chunk_index,
                    vector_json,
                    record.text_hash,
                    record.model_id,
                    record.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.execute(
            "UPDATE articles SET is_embedded = 1, embedding_model = ?2, embedded_at = ?3 \
             WHERE id = ?1",
            params![article_id.to_string(), model_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn embeddings_for(&self, article_id: Uuid) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT article_id, chunk_index, vector, text_hash, model_id, created_at \
             FROM embeddings WHERE article_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![article_id.to_string()], row_to_embedding)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn find_by_hash(&self, content_hash: &str) -> Result<Option<ArticleRecord>, StoreError> {
        let id: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id FROM articles WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?
        };
        match id {
            Some(id) => self.find_by_id(parse_uuid_str(&id)?),
            None => Ok(None),
        }
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<ArticleRecord>, StoreError> {
        let article = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS),
                params![id.to_string()],
                row_to_article,
            )
            .optional()?
        };
        match article {
            Some(article) => Ok(Some(self.attach_children(article)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ArticleRecord>, StoreError> {
        let article = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT {} FROM articles WHERE external_id = ?1",
                    ARTICLE_COLUMNS
                ),
                params![external_id],
                row_to_article,
            )
            .optional()?
        };
        match article {
            Some(article) => Ok(Some(self.attach_children(article)?)),
            None => Ok(None),
        }
    }

    pub fn list_unembedded(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError> {
        self.list_where(
            "is_embedded = 0 AND processing_error IS NULL ORDER BY ingested_at",
            limit,
            0,
        )
    }

    /// Recent window used as the near-duplicate comparison set.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError> {
        self.list_where("1=1 ORDER BY ingested_at DESC", limit, 0)
    }

    /// Stable full walk in ingest order, for admin sweeps.
    pub fn list_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ArticleRecord>, StoreError> {
        self.list_where("1=1 ORDER BY ingested_at, id", limit, offset)
    }

    /// Embedded articles in stable id order; the reconcile cursor pages
    /// through this.
    pub fn list_embedded(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ArticleRecord>, StoreError> {
        self.list_where("is_embedded = 1 ORDER BY id", limit, offset)
    }

    fn list_where(
        &self,
        clause: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ArticleRecord>, StoreError> {
        let bare: Vec<ArticleRecord> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM articles WHERE {} LIMIT ?1 OFFSET ?2",
                ARTICLE_COLUMNS, clause
            ))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_article)?;
            let mut articles = Vec::new();
            for row in rows {
                articles.push(row?);
            }
            articles
        };
        bare.into_iter()
            .map(|article| self.attach_children(article))
            .collect()
    }

    pub fn bulk_load(&self, ids: &[Uuid]) -> Result<Vec<ArticleRecord>, StoreError> {
        let mut articles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(article) = self.find_by_id(*id)? {
                articles.push(article);
            }
        }
        Ok(articles)
    }

    /// Lexical candidate fetch: case-insensitive substring match over title,
    /// summary, and body, plus exact joined keyword-row matches. Order of
    /// first discovery is preserved.
    pub fn keyword_candidates(
        &self,
        tokens: &[String],
        limit: usize,
    ) -> Result<Vec<ArticleRecord>, StoreError> {
        let mut ids: Vec<Uuid> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        {
            let conn = self.conn.lock();
            for token in tokens {
                if ids.len() >= limit {
                    break;
                }
                let lowered = token.to_lowercase();
                let pattern = format!("%{}%", lowered);

                let mut stmt = conn.prepare(
                    "SELECT id FROM articles WHERE lower(title) LIKE ?1 \
                     OR lower(summary) LIKE ?1 OR lower(body) LIKE ?1 LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![pattern, limit as i64], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    let id = parse_uuid_str(&row?)?;
                    if seen.insert(id) {
                        ids.push(id);
                    }
                }

                let mut stmt = conn.prepare(
                    "SELECT DISTINCT article_id FROM article_keywords \
                     WHERE lower(keyword) = ?1 LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![lowered, limit as i64], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    let id = parse_uuid_str(&row?)?;
                    if seen.insert(id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.truncate(limit);
        self.bulk_load(&ids)
    }

    pub fn metadata_for(&self, article_id: Uuid) -> Result<Option<MetadataRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT article_type, importance_score, indexing_text, metadata_hash, \
                 content_length, word_count, has_images, has_stock_codes, entities \
                 FROM article_metadata WHERE article_id = ?1",
                params![article_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(ty, score, text, hash, content_length, word_count, has_images, has_codes, entities)| {
                MetadataRecord {
                    article_id,
                    entities: serde_json::from_str::<EntityBuckets>(&entities).unwrap_or_default(),
                    article_type: ArticleType::parse(&ty),
                    importance_score: score,
                    indexing_text: text,
                    metadata_hash: hash,
                    content_length: content_length as usize,
                    word_count: word_count as usize,
                    has_images: has_images != 0,
                    has_stock_codes: has_codes != 0,
                }
            },
        ))
    }

    /// Delete one article; child rows cascade. Returns true if a row went away.
    pub fn delete_article(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM articles WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    pub fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO processing_log (article_id, phase, status, message, duration_ms, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.article_id.map(|id| id.to_string()),
                entry.phase.as_str(),
                entry.status.as_str(),
                entry.message,
                entry.duration_ms.map(|d| d as i64),
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<ProcessingLogEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT article_id, phase, status, message, duration_ms, timestamp \
             FROM processing_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (article_id, phase, status, message, duration_ms, timestamp) = row?;
            entries.push(ProcessingLogEntry {
                article_id: match article_id {
                    Some(id) => Some(parse_uuid_str(&id)?),
                    None => None,
                },
                phase: parse_phase(&phase),
                status: parse_status(&status),
                message,
                duration_ms: duration_ms.map(|d| d as u64),
                timestamp: parse_datetime_str(&timestamp)?,
            });
        }
        Ok(entries)
    }

    // ── IndexState bookkeeping ─────────────────────────────────────────────

    /// Insert or replace an index state. Activating one deactivates the rest
    /// in the same transaction, so exactly one state can be active.
    pub fn save_index_state(&self, state: &IndexState) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if state.active {
            tx.execute("UPDATE index_states SET active = 0 WHERE name != ?1", params![state.name])?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO index_states (name, provider_index_id, endpoint_id, \
             deployed_id, dimensions, distance, total_vectors, last_updated, active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                state.name,
                state.provider_index_id,
                state.endpoint_id,
                state.deployed_id,
                state.dimensions as i64,
                state.distance.as_str(),
                state.total_vectors as i64,
                state.last_updated.map(|t| t.to_rfc3339()),
                state.active as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn active_index_state(&self) -> Result<Option<IndexState>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, provider_index_id, endpoint_id, deployed_id, dimensions, distance, \
             total_vectors, last_updated, active FROM index_states WHERE active = 1",
            [],
            row_to_index_state,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn index_state(&self, name: &str) -> Result<Option<IndexState>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, provider_index_id, endpoint_id, deployed_id, dimensions, distance, \
             total_vectors, last_updated, active FROM index_states WHERE name = ?1",
            params![name],
            row_to_index_state,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Monotonic counter bump after a successful upsert batch. Reconciliation
    /// may correct it later.
    pub fn bump_index_vectors(&self, name: &str, added: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE index_states SET total_vectors = total_vectors + ?2, last_updated = ?3 \
             WHERE name = ?1",
            params![name, added as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_index_state(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM index_states WHERE name = ?1", params![name])?;
        Ok(())
    }

    // ── Stats & discovery surfaces ─────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<u64, StoreError> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };
        let cutoff = (Utc::now() - Duration::days(1)).to_rfc3339();
        let recent: i64 = conn.query_row(
            "SELECT COUNT(*) FROM articles WHERE ingested_at >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(StoreStats {
            total_articles: count("SELECT COUNT(*) FROM articles")?,
            embedded_articles: count("SELECT COUNT(*) FROM articles WHERE is_embedded = 1")?,
            errored_articles: count(
                "SELECT COUNT(*) FROM articles WHERE processing_error IS NOT NULL",
            )?,
            recent_articles: recent as u64,
            total_vectors: count("SELECT COUNT(*) FROM embeddings")?,
        })
    }

    /// Article counts per inferred type.
    pub fn type_counts(&self) -> Result<Vec<(ArticleType, u64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT article_type, COUNT(*) FROM article_metadata GROUP BY article_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (ty, count) = row?;
            counts.push((ArticleType::parse(&ty), count as u64));
        }
        Ok(counts)
    }

    /// Most frequent keywords over articles published in the last `days`.
    pub fn popular_keywords(
        &self,
        days: i64,
        limit: usize,
    ) -> Result<Vec<(String, KeywordKind, u64)>, StoreError> {
        let conn = self.conn.lock();
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT k.keyword, k.keyword_type, COUNT(*) AS uses FROM article_keywords k \
             JOIN articles a ON a.id = k.article_id \
             WHERE a.publish_time >= ?1 \
             GROUP BY k.keyword, k.keyword_type ORDER BY uses DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut keywords = Vec::new();
        for row in rows {
            let (keyword, kind, count) = row?;
            keywords.push((keyword, KeywordKind::parse(&kind), count as u64));
        }
        Ok(keywords)
    }

    /// Title suggestions for a query prefix/fragment.
    pub fn search_suggestions(
        &self,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", fragment.to_lowercase());
        let mut stmt = conn.prepare(
            "SELECT DISTINCT title FROM articles WHERE lower(title) LIKE ?1 LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut titles = Vec::new();
        for row in rows {
            titles.push(row?);
        }
        Ok(titles)
    }

    fn attach_children(&self, mut article: ArticleRecord) -> Result<ArticleRecord, StoreError> {
        let conn = self.conn.lock();
        let id = article.id.to_string();

        let mut stmt = conn.prepare(
            "SELECT code_id, code_nm, large_code_id, large_code_nm, middle_code_id, \
             middle_code_nm, small_code_id, small_code_nm FROM article_categories \
             WHERE article_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(Category {
                code_id: row.get(0)?,
                code_nm: row.get(1)?,
                large_code_id: row.get(2)?,
                large_code_nm: row.get(3)?,
                middle_code_id: row.get(4)?,
                middle_code_nm: row.get(5)?,
                small_code_id: row.get(6)?,
                small_code_nm: row.get(7)?,
            })
        })?;
        article.categories = rows.collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT keyword, keyword_type FROM article_keywords WHERE article_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(Keyword {
                keyword: row.get(0)?,
                kind: KeywordKind::parse(&row.get::<_, String>(1)?),
            })
        })?;
        article.keywords = rows.collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT stock_code FROM article_stock_codes WHERE article_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        article.stock_codes = rows.collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT image_url, image_caption FROM article_images WHERE article_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(ArticleImage {
                image_url: row.get(0)?,
                image_caption: row.get(1)?,
            })
        })?;
        article.images = rows.collect::<Result<_, _>>()?;

        Ok(article)
    }
}

fn row_to_article(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArticleRecord> {
    Ok(ArticleRecord {
        id: parse_uuid_sql(row.get::<_, String>(0)?, 0)?,
        external_id: row.get(1)?,
        title: row.get(2)?,
        subtitle: row.get(3)?,
        body: row.get(4)?,
        summary: row.get(5)?,
        writers: row.get(6)?,
        publish_time: parse_dt_sql(row.get::<_, Option<String>>(7)?, 7)?,
        registered_time: parse_dt_sql(row.get::<_, Option<String>>(8)?, 8)?,
        modified_time: parse_dt_sql(row.get::<_, Option<String>>(9)?, 9)?,
        source_url: row.get(10)?,
        media_code: row.get(11)?,
        edition: row.get(12)?,
        section: row.get(13)?,
        page: row.get(14)?,
        article_year: row.get(15)?,
        content_hash: row.get(16)?,
        ingested_at: parse_dt_sql(row.get::<_, Option<String>>(17)?, 17)?
            .unwrap_or_else(Utc::now),
        is_embedded: row.get::<_, i64>(18)? != 0,
        embedding_model: row.get(19)?,
        embedded_at: parse_dt_sql(row.get::<_, Option<String>>(20)?, 20)?,
        processing_error: row.get(21)?,
        similar_to: match row.get::<_, Option<String>>(22)? {
            Some(s) => Some(parse_uuid_sql(s, 22)?),
            None => None,
        },
        categories: Vec::new(),
        keywords: Vec::new(),
        stock_codes: Vec::new(),
        images: Vec::new(),
    })
}

fn row_to_embedding(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let vector_json: String = row.get(2)?;
    let vector: Vec<f32> = serde_json::from_str(&vector_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EmbeddingRecord {
        article_id: parse_uuid_sql(row.get::<_, String>(0)?, 0)?,
        chunk_index: row.get::<_, i64>(1)? as u32,
        vector,
        text_hash: row.get(3)?,
        model_id: row.get(4)?,
        created_at: parse_dt_sql(row.get::<_, Option<String>>(5)?, 5)?.unwrap_or_else(Utc::now),
    })
}

fn row_to_index_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexState> {
    Ok(IndexState {
        name: row.get(0)?,
        provider_index_id: row.get(1)?,
        endpoint_id: row.get(2)?,
        deployed_id: row.get(3)?,
        dimensions: row.get::<_, i64>(4)? as usize,
        distance: crate::types::Distance::parse(&row.get::<_, String>(5)?),
        total_vectors: row.get::<_, i64>(6)? as u64,
        last_updated: parse_dt_sql(row.get::<_, Option<String>>(7)?, 7)?,
        active: row.get::<_, i64>(8)? != 0,
    })
}

fn parse_uuid_sql(s: String, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_dt_sql(s: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
        None => Ok(None),
    }
}

fn parse_uuid_str(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Permanent(format!("bad uuid in store: {}", e)))
}

fn parse_datetime_str(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Permanent(format!("bad timestamp in store: {}", e)))
}

fn parse_phase(s: &str) -> Phase {
    match s {
        "parse" => Phase::Parse,
        "dedup" => Phase::Dedup,
        "embed" => Phase::Embed,
        "index_upsert" => Phase::IndexUpsert,
        "query" => Phase::Query,
        _ => Phase::Analysis,
    }
}

fn parse_status(s: &str) -> LogStatus {
    match s {
        "success" => LogStatus::Success,
        "duplicate" => LogStatus::Duplicate,
        _ => LogStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::extractor::MetadataExtractor;
    use crate::ingest::hasher::ContentHasher;

    fn sample(external_id: &str, title: &str, body: &str) -> (ArticleRecord, MetadataRecord) {
        let hasher = ContentHasher::default();
        let article = ArticleRecord {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            subtitle: None,
            body: body.to_string(),
            summary: Some(format!("{} 요약", title)),
            writers: Some("김기자".to_string()),
            publish_time: Some(Utc::now()),
            registered_time: None,
            modified_time: None,
            source_url: Some("http://news.example.com/1".to_string()),
            media_code: Some("mk".to_string()),
            edition: None,
            section: None,
            page: None,
            article_year: Some(2024),
            categories: vec![Category {
                large_code_nm: Some("증권".to_string()),
                ..Default::default()
            }],
            keywords: vec![Keyword {
                keyword: "주가".to_string(),
                kind: KeywordKind::General,
            }],
            stock_codes: vec!["005930".to_string()],
            images: vec![],
            content_hash: hasher.article_content_hash(title, body, ""),
            ingested_at: Utc::now(),
            is_embedded: false,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        };
        let metadata = MetadataExtractor::default().extract(&article);
        (article, metadata)
    }

    #[test]
    fn insert_and_load_round_trip() {
        let store = ArticleStore::in_memory().unwrap();
        let (article, metadata) = sample("A-001", "삼성전자 주가 급등", "삼성전자 주가가 급등했다.");
        let id = store.insert_article(&article, &metadata).unwrap();

        let loaded = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(loaded.external_id, "A-001");
        assert_eq!(loaded.categories.len(), 1);
        assert_eq!(loaded.stock_codes, vec!["005930"]);
        assert!(!loaded.is_embedded);

        let meta = store.metadata_for(id).unwrap().unwrap();
        assert_eq!(meta.metadata_hash, metadata.metadata_hash);
    }

    #[test]
    fn duplicate_hash_insert_conflicts_and_store_keeps_one() {
        let store = ArticleStore::in_memory().unwrap();
        let (a, meta_a) = sample("A-001", "동일 기사", "완전히 같은 본문이다.");
        let (mut b, meta_b) = sample("A-002", "동일 기사", "완전히 같은 본문이다.");
        b.content_hash = a.content_hash.clone();

        store.insert_article(&a, &meta_a).unwrap();
        let err = store.insert_article(&b, &meta_b).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.stats().unwrap().total_articles, 1);
    }

    #[test]
    fn duplicate_external_id_conflicts() {
        let store = ArticleStore::in_memory().unwrap();
        let (a, meta_a) = sample("A-001", "기사 하나", "본문 하나.");
        let (b, meta_b) = sample("A-001", "기사 둘", "본문 둘.");
        store.insert_article(&a, &meta_a).unwrap();
        assert!(matches!(
            store.insert_article(&b, &meta_b).unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[test]
    fn embedded_transition_is_transactional() {
        let store = ArticleStore::in_memory().unwrap();
        let (article, metadata) = sample("A-003", "임베딩 대상", "임베딩할 본문이다.");
        store.insert_article(&article, &metadata).unwrap();

        assert_eq!(store.list_unembedded(10).unwrap().len(), 1);

        let record = EmbeddingRecord {
            article_id: article.id,
            chunk_index: 0,
            vector: vec![0.1, 0.2, 0.3],
            text_hash: "abc".to_string(),
            model_id: "test-model".to_string(),
            created_at: Utc::now(),
        };
        store
            .commit_embeddings(article.id, std::slice::from_ref(&record), "test-model")
            .unwrap();

        let loaded = store.find_by_id(article.id).unwrap().unwrap();
        assert!(loaded.is_embedded);
        assert_eq!(loaded.embedding_model.as_deref(), Some("test-model"));
        assert!(store.list_unembedded(10).unwrap().is_empty());

        let vectors = store.embeddings_for(article.id).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].vector, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn mark_embedded_sets_model_and_timestamp() {
        let store = ArticleStore::in_memory().unwrap();
        let (article, metadata) = sample("A-010", "표시 대상", "본문.");
        store.insert_article(&article, &metadata).unwrap();

        store.mark_embedded(article.id, "local-multilingual-onnx").unwrap();
        let loaded = store.find_by_id(article.id).unwrap().unwrap();
        assert!(loaded.is_embedded);
        assert_eq!(
            loaded.embedding_model.as_deref(),
            Some("local-multilingual-onnx")
        );
        assert!(loaded.embedded_at.is_some());
    }

    #[test]
    fn set_error_is_write_once() {
        let store = ArticleStore::in_memory().unwrap();
        let (article, metadata) = sample("A-004", "오류 기사", "본문.");
        store.insert_article(&article, &metadata).unwrap();

        store.set_error(article.id, "first failure").unwrap();
        store.set_error(article.id, "second failure").unwrap();
        let loaded = store.find_by_id(article.id).unwrap().unwrap();
        assert_eq!(loaded.processing_error.as_deref(), Some("first failure"));
    }

    #[test]
    fn keyword_candidates_match_text_and_keyword_rows() {
        let store = ArticleStore::in_memory().unwrap();
        let (a, meta_a) = sample("A-005", "삼성전자 실적 발표", "분기 실적이 개선됐다.");
        let (b, meta_b) = sample("A-006", "부동산 시장 동향", "아파트 가격이 내렸다.");
        store.insert_article(&a, &meta_a).unwrap();
        store.insert_article(&b, &meta_b).unwrap();

        let hits = store
            .keyword_candidates(&["삼성전자".to_string()], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].external_id, "A-005");

        // keyword-row match ("주가" is a stored keyword on both)
        let hits = store.keyword_candidates(&["주가".to_string()], 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn single_active_index_state() {
        let store = ArticleStore::in_memory().unwrap();
        let mut first = IndexState::new("idx-a", 768, crate::types::Distance::DotProduct);
        first.active = true;
        store.save_index_state(&first).unwrap();

        let mut second = IndexState::new("idx-b", 768, crate::types::Distance::DotProduct);
        second.active = true;
        store.save_index_state(&second).unwrap();

        let active = store.active_index_state().unwrap().unwrap();
        assert_eq!(active.name, "idx-b");
        assert!(!store.index_state("idx-a").unwrap().unwrap().active);
    }

    #[test]
    fn log_round_trip() {
        let store = ArticleStore::in_memory().unwrap();
        let entry = ProcessingLogEntry::new(Phase::Parse, LogStatus::Success)
            .with_message("parsed ok")
            .with_duration_ms(12);
        store.append_log(&entry).unwrap();

        let logs = store.recent_logs(5).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].phase, Phase::Parse);
        assert_eq!(logs[0].message.as_deref(), Some("parsed ok"));
    }

    #[test]
    fn popular_keywords_and_suggestions() {
        let store = ArticleStore::in_memory().unwrap();
        let (a, meta_a) = sample("A-007", "반도체 수출 호조", "반도체 수출이 늘었다.");
        store.insert_article(&a, &meta_a).unwrap();

        let keywords = store.popular_keywords(30, 10).unwrap();
        assert!(keywords.iter().any(|(k, _, _)| k == "주가"));

        let suggestions = store.search_suggestions("반도체", 5).unwrap();
        assert_eq!(suggestions, vec!["반도체 수출 호조"]);
    }

    #[test]
    fn delete_cascades_children() {
        let store = ArticleStore::in_memory().unwrap();
        let (article, metadata) = sample("A-008", "삭제 대상", "본문.");
        store.insert_article(&article, &metadata).unwrap();
        assert!(store.delete_article(article.id).unwrap());
        assert!(store.find_by_id(article.id).unwrap().is_none());
        assert!(store.metadata_for(article.id).unwrap().is_none());
    }
}
