use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

use crate::cache::CacheStore;
use crate::models::{BibleBook, BibleVersion, Testament, Verse};

pub const DEFAULT_BIBLE_API_URL: &str = "https://api.scripture.api.bible/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Reference data changes rarely, so version and book lists get a long
// lifetime. Chapter content is treated as immutable per version id; the
// TTL bounds worst-case staleness if the upstream ever corrects text.
const VERSIONS_TTL_MINUTES: i64 = 7 * 24 * 60;
const BOOKS_TTL_MINUTES: i64 = 7 * 24 * 60;
const CHAPTER_TTL_MINUTES: i64 = 30 * 24 * 60;

const VERSIONS_CACHE_KEY: &str = "bible_versions";

// USFM codes of the 39 Old Testament books. Any other book id counts as
// New Testament.
const OLD_TESTAMENT_IDS: [&str; 39] = [
    "GEN", "EXO", "LEV", "NUM", "DEU", "JOS", "JDG", "RUT", "1SA", "2SA", "1KI", "2KI", "1CH",
    "2CH", "EZR", "NEH", "EST", "JOB", "PSA", "PRO", "ECC", "SNG", "ISA", "JER", "LAM", "EZK",
    "DAN", "HOS", "JOL", "AMO", "OBA", "JON", "MIC", "NAM", "HAB", "ZEP", "HAG", "ZEC", "MAL",
];

// --- Remote response shapes ---
// Every response wraps its payload in a `data` envelope; fields the API
// may omit are Options and defaulted at the mapping site.

#[derive(Deserialize, Debug)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize, Debug)]
struct ApiBible {
    id: String,
    name: String,
    abbreviation: String,
    language: ApiLanguage,
}

#[derive(Deserialize, Debug)]
struct ApiLanguage {
    id: String,
    name: String,
}

#[derive(Deserialize, Debug)]
struct ApiBook {
    id: String,
    name: String,
    chapters: Option<Vec<ApiChapter>>,
}

#[derive(Deserialize, Debug)]
struct ApiChapter {
    #[allow(dead_code)]
    id: String,
}

#[derive(Deserialize, Debug)]
struct ApiChapterContent {
    content: String,
}

#[derive(Deserialize, Debug)]
struct ApiVerseContent {
    id: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ApiSearchResult {
    #[serde(default)]
    verses: Vec<ApiSearchVerse>,
}

#[derive(Deserialize, Debug)]
struct ApiSearchVerse {
    id: String,
    #[serde(default)]
    text: Option<String>,
}

/// Client for the scripture content API.
///
/// Every list/chapter operation checks the cache before touching the
/// network and writes back on success. Failures never propagate: they
/// degrade to the built-in fallback (versions) or an empty result.
pub struct BibleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: CacheStore,
}

impl BibleClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, cache: CacheStore) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            cache,
        }
    }

    /// Lists available Bible versions. Falls back to a built-in list on
    /// total failure so callers are never left with zero choices.
    pub async fn list_versions(&self) -> Vec<BibleVersion> {
        if let Some(cached) = self.cache.get::<Vec<BibleVersion>>(VERSIONS_CACHE_KEY).await {
            log::debug!("Serving Bible versions from cache");
            return cached;
        }

        match self.fetch_versions().await {
            Ok(versions) => {
                self.cache
                    .put(VERSIONS_CACHE_KEY, &versions, Some(VERSIONS_TTL_MINUTES))
                    .await;
                versions
            }
            Err(e) => {
                log::error!("Get Bible versions failed: {:?}", e);
                default_versions()
            }
        }
    }

    /// Lists the books of one version. Returns an empty list on failure.
    pub async fn list_books(&self, version_id: &str) -> Vec<BibleBook> {
        let cache_key = format!("bible_books_{}", version_id);
        if let Some(cached) = self.cache.get::<Vec<BibleBook>>(&cache_key).await {
            log::debug!("Serving books for {} from cache", version_id);
            return cached;
        }

        match self.fetch_books(version_id).await {
            Ok(books) => {
                self.cache.put(&cache_key, &books, Some(BOOKS_TTL_MINUTES)).await;
                books
            }
            Err(e) => {
                log::error!("Get books for {} failed: {:?}", version_id, e);
                Vec::new()
            }
        }
    }

    /// Fetches one chapter as discrete verses. Returns an empty list on
    /// failure or when the chapter markup carries no verse markers.
    pub async fn get_chapter(&self, version_id: &str, book_id: &str, chapter: u32) -> Vec<Verse> {
        let cache_key = format!("bible_chapter_{}_{}_{}", version_id, book_id, chapter);
        if let Some(cached) = self.cache.get::<Vec<Verse>>(&cache_key).await {
            log::debug!("Serving chapter {}.{} from cache", book_id, chapter);
            return cached;
        }

        match self.fetch_chapter(version_id, book_id, chapter).await {
            Ok(verses) => {
                self.cache
                    .put(&cache_key, &verses, Some(CHAPTER_TTL_MINUTES))
                    .await;
                verses
            }
            Err(e) => {
                log::error!("Get chapter {}.{} failed: {:?}", book_id, chapter, e);
                Vec::new()
            }
        }
    }

    /// Fetches a single verse. Uncached; single-verse lookups are
    /// infrequent and latency-tolerant. Returns None on any failure.
    pub async fn get_verse(
        &self,
        version_id: &str,
        book_id: &str,
        chapter: u32,
        verse_number: u32,
    ) -> Option<Verse> {
        match self.fetch_verse(version_id, book_id, chapter, verse_number).await {
            Ok(verse) => Some(verse),
            Err(e) => {
                log::error!(
                    "Get verse {}.{}.{} failed: {:?}",
                    book_id,
                    chapter,
                    verse_number,
                    e
                );
                None
            }
        }
    }

    /// Full-text search, with query semantics delegated entirely to the
    /// remote API. Returns an empty list on failure.
    pub async fn search_verses(&self, version_id: &str, query: &str, limit: u32) -> Vec<Verse> {
        match self.fetch_search(version_id, query, limit).await {
            Ok(verses) => verses,
            Err(e) => {
                log::error!("Search '{}' in {} failed: {:?}", query, version_id, e);
                Vec::new()
            }
        }
    }

    /// Drops all cached scripture data (versions, book lists, chapters).
    pub async fn clear_cache(&self) {
        self.cache.clear_prefix("bible_").await;
    }

    // --- Network layer ---

    async fn fetch_versions(&self) -> Result<Vec<BibleVersion>, anyhow::Error> {
        let response = self
            .client
            .get(self.endpoint("/bibles"))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("Failed to request Bible versions")?;
        let response = check_status(response).await?;

        let envelope: DataEnvelope<Vec<ApiBible>> = response
            .json()
            .await
            .context("Failed to parse Bible versions response")?;

        Ok(envelope
            .data
            .into_iter()
            .map(|bible| BibleVersion {
                id: bible.id,
                name: bible.name,
                abbreviation: bible.abbreviation,
                language: bible.language.name,
                language_code: bible.language.id,
            })
            .collect())
    }

    async fn fetch_books(&self, version_id: &str) -> Result<Vec<BibleBook>, anyhow::Error> {
        let response = self
            .client
            .get(self.endpoint(&format!("/bibles/{}/books", version_id)))
            .header("api-key", &self.api_key)
            // Without this the API omits chapter data and every book would
            // report zero chapters.
            .query(&[("include-chapters", "true")])
            .send()
            .await
            .context("Failed to request book list")?;
        let response = check_status(response).await?;

        let envelope: DataEnvelope<Vec<ApiBook>> = response
            .json()
            .await
            .context("Failed to parse book list response")?;

        Ok(envelope
            .data
            .into_iter()
            .map(|book| BibleBook {
                testament: testament_for(&book.id),
                chapter_count: book.chapters.map(|c| c.len() as u32).unwrap_or(0),
                id: book.id,
                name: book.name,
            })
            .collect())
    }

    async fn fetch_chapter(
        &self,
        version_id: &str,
        book_id: &str,
        chapter: u32,
    ) -> Result<Vec<Verse>, anyhow::Error> {
        let chapter_id = format!("{}.{}", book_id, chapter);
        let response = self
            .client
            .get(self.endpoint(&format!("/bibles/{}/chapters/{}", version_id, chapter_id)))
            .header("api-key", &self.api_key)
            .query(&[("include-verse-spans", "false")])
            .send()
            .await
            .context("Failed to request chapter content")?;
        let response = check_status(response).await?;

        let envelope: DataEnvelope<ApiChapterContent> = response
            .json()
            .await
            .context("Failed to parse chapter response")?;

        Ok(parse_verses(&envelope.data.content, book_id, chapter, version_id))
    }

    async fn fetch_verse(
        &self,
        version_id: &str,
        book_id: &str,
        chapter: u32,
        verse_number: u32,
    ) -> Result<Verse, anyhow::Error> {
        let verse_id = format!("{}.{}.{}", book_id, chapter, verse_number);
        let response = self
            .client
            .get(self.endpoint(&format!("/bibles/{}/verses/{}", version_id, verse_id)))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("Failed to request verse")?;
        let response = check_status(response).await?;

        let envelope: DataEnvelope<ApiVerseContent> = response
            .json()
            .await
            .context("Failed to parse verse response")?;

        Ok(Verse {
            id: envelope.data.id,
            book_id: book_id.to_string(),
            chapter,
            verse_number,
            text: clean_text(&envelope.data.content),
            version_id: version_id.to_string(),
        })
    }

    async fn fetch_search(
        &self,
        version_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<Verse>, anyhow::Error> {
        let response = self
            .client
            .get(self.endpoint(&format!("/bibles/{}/search", version_id)))
            .header("api-key", &self.api_key)
            .query(&[("query", query), ("limit", &limit.to_string())])
            .send()
            .await
            .context("Failed to request verse search")?;
        let response = check_status(response).await?;

        let envelope: DataEnvelope<ApiSearchResult> = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(envelope
            .data
            .verses
            .into_iter()
            .filter_map(|verse| {
                let Some((book_id, chapter, verse_number)) = split_verse_id(&verse.id) else {
                    log::warn!("Skipping search result with malformed id: {}", verse.id);
                    return None;
                };
                Some(Verse {
                    id: verse.id,
                    book_id,
                    chapter,
                    verse_number,
                    text: clean_text(verse.text.as_deref().unwrap_or_default()),
                    version_id: version_id.to_string(),
                })
            })
            .collect())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

// Bails with a short status-tagged message on non-2xx, logging whatever
// body the server sent.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, anyhow::Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("Scripture API request failed with status {}: {}", status, body);
    anyhow::bail!("API request failed with status {}", status)
}

/// Hardcoded fallback so the caller always has at least one version even
/// when the API is unreachable.
pub fn default_versions() -> Vec<BibleVersion> {
    vec![
        BibleVersion {
            id: "de4e12af7f28f599-02".to_string(),
            name: "King James Version".to_string(),
            abbreviation: "KJV".to_string(),
            language: "English".to_string(),
            language_code: "eng".to_string(),
        },
        BibleVersion {
            id: "592420522e16049f-01".to_string(),
            name: "Reina Valera 1909".to_string(),
            abbreviation: "RVR09".to_string(),
            language: "Spanish".to_string(),
            language_code: "spa".to_string(),
        },
    ]
}

static VERSE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span[^>]*class="v"[^>]*>(\d+)</span>"#).expect("valid regex"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Parses marked-up chapter content into discrete verses.
///
/// Scans for verse-number markers and captures the text run between one
/// marker and the next (or end of content for the final verse). Verse
/// order follows marker order in the source, not numeric order; content
/// before the first marker is ignored.
pub fn parse_verses(content: &str, book_id: &str, chapter: u32, version_id: &str) -> Vec<Verse> {
    let markers: Vec<(usize, usize, u32)> = VERSE_MARKER
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1)?.as_str().parse::<u32>().ok()?;
            Some((whole.start(), whole.end(), number))
        })
        .collect();

    let mut verses = Vec::with_capacity(markers.len());
    for (i, &(_, text_start, number)) in markers.iter().enumerate() {
        let text_end = markers
            .get(i + 1)
            .map(|&(next_start, _, _)| next_start)
            .unwrap_or(content.len());
        verses.push(Verse {
            id: format!("{}.{}.{}", book_id, chapter, number),
            book_id: book_id.to_string(),
            chapter,
            verse_number: number,
            text: clean_text(&content[text_start..text_end]),
            version_id: version_id.to_string(),
        });
    }
    verses
}

/// Strips markup tags and decodes the handful of entities the scripture
/// API actually emits.
pub fn clean_text(html: &str) -> String {
    TAG.replace_all(html, "")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

// Splits a canonical verse id ("GEN.1.5") into book, chapter and verse.
fn split_verse_id(id: &str) -> Option<(String, u32, u32)> {
    let mut parts = id.split('.');
    let book = parts.next()?;
    let chapter = parts.next()?.parse().ok()?;
    let verse = parts.next()?.parse().ok()?;
    if parts.next().is_some() || book.is_empty() {
        return None;
    }
    Some((book.to_string(), chapter, verse))
}

fn testament_for(book_id: &str) -> Testament {
    if OLD_TESTAMENT_IDS.contains(&book_id) {
        Testament::Old
    } else {
        Testament::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_marked_up_chapter_into_verses() {
        let content = r#"<p class="p"><span data-number="1" class="v">1</span>In the beginning <b>God</b> created&nbsp;the heaven and the earth. <span data-number="2" class="v">2</span>And the earth was without form, &amp; void. <span data-number="3" class="v">3</span>And God said, &quot;Let there be light&quot;</p>"#;

        let verses = parse_verses(content, "GEN", 1, "kjv");
        assert_eq!(verses.len(), 3);

        assert_eq!(verses[0].id, "GEN.1.1");
        assert_eq!(verses[0].verse_number, 1);
        assert_eq!(
            verses[0].text,
            "In the beginning God created the heaven and the earth."
        );

        assert_eq!(verses[1].text, "And the earth was without form, & void.");
        assert_eq!(verses[2].text, "And God said, \"Let there be light\"");

        for verse in &verses {
            assert_eq!(verse.book_id, "GEN");
            assert_eq!(verse.chapter, 1);
            assert_eq!(verse.version_id, "kjv");
        }
    }

    #[test]
    fn verse_order_follows_marker_order_not_numeric_order() {
        let content = r#"<span class="v">2</span>second <span class="v">1</span>first <span class="v">3</span>third"#;
        let verses = parse_verses(content, "PSA", 3, "kjv");
        let numbers: Vec<u32> = verses.iter().map(|v| v.verse_number).collect();
        assert_eq!(numbers, vec![2, 1, 3]);
    }

    #[test]
    fn verse_numbers_may_have_gaps() {
        let content = r#"<span class="v">1</span>one <span class="v">5</span>five"#;
        let verses = parse_verses(content, "JHN", 3, "kjv");
        assert_eq!(verses.len(), 2);
        assert_eq!(verses[1].verse_number, 5);
        assert_eq!(verses[1].id, "JHN.3.5");
    }

    #[test]
    fn content_without_markers_yields_no_verses() {
        assert!(parse_verses("<p>prologue only</p>", "GEN", 1, "kjv").is_empty());
        assert!(parse_verses("", "GEN", 1, "kjv").is_empty());
    }

    #[test]
    fn text_before_first_marker_is_ignored() {
        let content = r#"<p>Chapter heading</p><span class="v">1</span>actual verse"#;
        let verses = parse_verses(content, "GEN", 1, "kjv");
        assert_eq!(verses.len(), 1);
        assert_eq!(verses[0].text, "actual verse");
    }

    #[test]
    fn clean_text_strips_tags_and_decodes_entities() {
        assert_eq!(
            clean_text("  <p>bread&nbsp;&amp;&nbsp;wine</p> "),
            "bread & wine"
        );
        assert_eq!(clean_text("<i>&quot;I am&quot;</i>"), "\"I am\"");
        assert_eq!(clean_text("God&#39;s word"), "God's word");
        assert_eq!(clean_text("no markup"), "no markup");
    }

    #[test]
    fn splits_canonical_verse_ids() {
        assert_eq!(
            split_verse_id("GEN.1.5"),
            Some(("GEN".to_string(), 1, 5))
        );
        assert_eq!(split_verse_id("JHN.3.16"), Some(("JHN".to_string(), 3, 16)));
        assert_eq!(split_verse_id("GEN.1"), None);
        assert_eq!(split_verse_id("GEN.one.5"), None);
        assert_eq!(split_verse_id(""), None);
    }

    #[test]
    fn classifies_testaments_by_book_id() {
        assert_eq!(testament_for("GEN"), Testament::Old);
        assert_eq!(testament_for("MAL"), Testament::Old);
        assert_eq!(testament_for("MAT"), Testament::New);
        assert_eq!(testament_for("REV"), Testament::New);
    }

    #[test]
    fn fallback_versions_include_kjv() {
        let versions = default_versions();
        assert!(!versions.is_empty());
        assert!(versions.iter().any(|v| v.abbreviation == "KJV"));
    }
}
