//! Resolves a library item to a catalog book/edition. Identifier-based
//! lookups are tried in a fixed order (ASIN, ISBN, then the derived
//! title+author key), with the cache consulted under every applicable key
//! before any remote search.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::abs_client::LibraryItem;
use crate::cache::{CacheKey, IdentifierType, ProgressCache};
use crate::hardcover_client::{CatalogService, Edition, STATUS_READING, UserBook};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub isbn: Option<String>,
    pub asin: Option<String>,
    pub title: String,
    pub author: String,
}

impl Identity {
    /// The fallback identity; always computable.
    pub fn title_author_key(&self) -> String {
        format!("{}:{}", squash(&self.title), squash(&self.author))
    }

    /// The strongest available identifier. At most one of isbn/asin is
    /// authoritative per lookup.
    pub fn preferred(&self) -> CacheKey {
        if let Some(asin) = &self.asin {
            CacheKey {
                identifier: asin.clone(),
                kind: IdentifierType::Asin,
            }
        } else if let Some(isbn) = &self.isbn {
            CacheKey {
                identifier: isbn.clone(),
                kind: IdentifierType::Isbn,
            }
        } else {
            CacheKey {
                identifier: self.title_author_key(),
                kind: IdentifierType::TitleAuthor,
            }
        }
    }

    /// Every key this item could have been cached under. An item may have
    /// been cached under title_author before it acquired an identifier.
    pub fn cache_keys(&self) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(3);
        if let Some(asin) = &self.asin {
            keys.push(CacheKey {
                identifier: asin.clone(),
                kind: IdentifierType::Asin,
            });
        }
        if let Some(isbn) = &self.isbn {
            keys.push(CacheKey {
                identifier: isbn.clone(),
                kind: IdentifierType::Isbn,
            });
        }
        keys.push(CacheKey {
            identifier: self.title_author_key(),
            kind: IdentifierType::TitleAuthor,
        });
        keys
    }
}

fn squash(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip hyphens and spaces, uppercase, and validate as ISBN-10 or ISBN-13.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase();
    let bytes = cleaned.as_bytes();
    let valid = match bytes.len() {
        10 => {
            bytes[..9].iter().all(u8::is_ascii_digit)
                && (bytes[9].is_ascii_digit() || bytes[9] == b'X')
        }
        13 => bytes.iter().all(u8::is_ascii_digit),
        _ => false,
    };
    valid.then_some(cleaned)
}

/// ASINs are 10 alphanumeric characters, start with a letter, and are never
/// purely numeric (that would be a malformed ISBN-10).
pub fn normalize_asin(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let valid = cleaned.len() == 10
        && cleaned.chars().all(|c| c.is_ascii_alphanumeric())
        && cleaned.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && !cleaned.chars().all(|c| c.is_ascii_digit());
    valid.then_some(cleaned)
}

/// Pull identifiers out of the item's metadata. The primary fields are
/// checked first, then the provider-specific spillover keys.
pub fn extract_identity(item: &LibraryItem) -> Identity {
    let metadata = &item.media.metadata;

    let mut isbn = metadata.isbn.as_deref().and_then(normalize_isbn);
    if isbn.is_none() {
        for key in ["isbn_13", "isbn13", "isbn_10", "isbn10"] {
            if let Some(candidate) = metadata.extra.get(key).and_then(|v| v.as_str()) {
                isbn = normalize_isbn(candidate);
                if isbn.is_some() {
                    break;
                }
            }
        }
    }

    let mut asin = metadata.asin.as_deref().and_then(normalize_asin);
    if asin.is_none() {
        for key in ["audible_asin", "audibleAsin"] {
            if let Some(candidate) = metadata.extra.get(key).and_then(|v| v.as_str()) {
                asin = normalize_asin(candidate);
                if asin.is_some() {
                    break;
                }
            }
        }
    }

    Identity {
        isbn,
        asin,
        title: item.title().to_string(),
        author: item.author().to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Cache(IdentifierType),
    UserLibrary(IdentifierType),
    RemoteSearch(IdentifierType),
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSource::Cache(k) => write!(f, "cache:{}", k),
            MatchSource::UserLibrary(k) => write!(f, "library:{}", k),
            MatchSource::RemoteSearch(k) => write!(f, "search:{}", k),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogMatch {
    pub user_book_id: Option<i64>,
    pub book_id: Option<i64>,
    pub edition_id: Option<i64>,
    pub edition_pages: Option<i64>,
    pub edition_seconds: Option<i64>,
    pub auto_added: bool,
    pub source: MatchSource,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub identity: Identity,
    pub matched: Option<CatalogMatch>,
}

/// Lookup structure over one fetch of the user's catalog books.
#[derive(Debug, Default)]
pub struct UserBookIndex {
    books: Vec<UserBook>,
    by_isbn: HashMap<String, (usize, Edition)>,
    by_asin: HashMap<String, (usize, Edition)>,
    by_edition: HashMap<i64, (usize, Edition)>,
    by_book: HashMap<i64, usize>,
    by_title_author: HashMap<String, usize>,
}

impl UserBookIndex {
    pub fn build(books: Vec<UserBook>) -> Self {
        let mut index = UserBookIndex {
            books,
            ..Default::default()
        };
        for (i, ub) in index.books.iter().enumerate() {
            let mut editions: Vec<&Edition> = Vec::new();
            if let Some(e) = &ub.edition {
                editions.push(e);
            }
            if let Some(book) = &ub.book {
                index.by_book.insert(book.id, i);
                let key = format!("{}:{}", squash(ub.title()), squash(ub.author_name()));
                index.by_title_author.entry(key).or_insert(i);
                editions.extend(book.editions.iter());
            }
            for e in editions {
                index.by_edition.entry(e.id).or_insert((i, e.clone()));
                if let Some(isbn) = e.isbn_13.as_deref().and_then(normalize_isbn) {
                    index.by_isbn.entry(isbn).or_insert((i, e.clone()));
                }
                if let Some(isbn) = e.isbn_10.as_deref().and_then(normalize_isbn) {
                    index.by_isbn.entry(isbn).or_insert((i, e.clone()));
                }
                if let Some(asin) = e.asin.as_deref().and_then(normalize_asin) {
                    index.by_asin.entry(asin).or_insert((i, e.clone()));
                }
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn lookup_isbn(&self, isbn: &str) -> Option<(&UserBook, &Edition)> {
        self.by_isbn.get(isbn).map(|(i, e)| (&self.books[*i], e))
    }

    pub fn lookup_asin(&self, asin: &str) -> Option<(&UserBook, &Edition)> {
        self.by_asin.get(asin).map(|(i, e)| (&self.books[*i], e))
    }

    pub fn lookup_edition(&self, edition_id: i64) -> Option<(&UserBook, &Edition)> {
        self.by_edition
            .get(&edition_id)
            .map(|(i, e)| (&self.books[*i], e))
    }

    pub fn lookup_book(&self, book_id: i64) -> Option<&UserBook> {
        self.by_book.get(&book_id).map(|i| &self.books[*i])
    }

    pub fn lookup_title_author(&self, key: &str) -> Option<&UserBook> {
        self.by_title_author.get(key).map(|i| &self.books[*i])
    }
}

pub struct BookMatcher {
    catalog: Arc<dyn CatalogService>,
    cache: Arc<ProgressCache>,
    user_id: String,
    auto_add: bool,
}

impl BookMatcher {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        cache: Arc<ProgressCache>,
        user_id: impl Into<String>,
        auto_add: bool,
    ) -> Self {
        BookMatcher {
            catalog,
            cache,
            user_id: user_id.into(),
            auto_add,
        }
    }

    /// Ordered identity resolution; first hit wins.
    #[tracing::instrument(level = "debug", skip(self, item, index), fields(item_id = %item.id))]
    pub async fn resolve(
        &self,
        item: &LibraryItem,
        index: &UserBookIndex,
    ) -> anyhow::Result<Resolution> {
        let identity = extract_identity(item);

        // The cache may hold this item under any applicable key type, not
        // just the one implied by currently-available identifiers.
        let keys = identity.cache_keys();
        if let Some((key, info)) = self.cache.find_any(&self.user_id, &identity.title, &keys).await
        {
            if let Some(edition_id) = info.edition_id.as_deref().and_then(|e| e.parse::<i64>().ok())
            {
                if let Some((ub, edition)) = index.lookup_edition(edition_id) {
                    tracing::debug!(key = %key.kind, edition_id, "matched from cache");
                    return Ok(Resolution {
                        matched: Some(from_user_book(
                            ub,
                            Some(edition),
                            MatchSource::Cache(key.kind),
                        )),
                        identity,
                    });
                }
                tracing::debug!(
                    edition_id,
                    "cached edition no longer in user library, re-resolving"
                );
            }
        }

        if let Some(asin) = identity.asin.clone() {
            if let Some(matched) = self
                .resolve_identifier(&asin, IdentifierType::Asin, index)
                .await?
            {
                return Ok(Resolution {
                    matched: Some(matched),
                    identity,
                });
            }
        }

        if let Some(isbn) = identity.isbn.clone() {
            if let Some(matched) = self
                .resolve_identifier(&isbn, IdentifierType::Isbn, index)
                .await?
            {
                return Ok(Resolution {
                    matched: Some(matched),
                    identity,
                });
            }
        }

        // Fallback identity: the user's own book list only, no remote
        // full-text search.
        if let Some(ub) = index.lookup_title_author(&identity.title_author_key()) {
            let edition = default_edition(ub);
            return Ok(Resolution {
                matched: Some(from_user_book(
                    ub,
                    edition,
                    MatchSource::UserLibrary(IdentifierType::TitleAuthor),
                )),
                identity,
            });
        }

        tracing::debug!(title = %identity.title, "no catalog match");
        Ok(Resolution {
            matched: None,
            identity,
        })
    }

    async fn resolve_identifier(
        &self,
        identifier: &str,
        kind: IdentifierType,
        index: &UserBookIndex,
    ) -> anyhow::Result<Option<CatalogMatch>> {
        let local = match kind {
            IdentifierType::Asin => index.lookup_asin(identifier),
            IdentifierType::Isbn => index.lookup_isbn(identifier),
            IdentifierType::TitleAuthor => None,
        };
        if let Some((ub, edition)) = local {
            return Ok(Some(from_user_book(
                ub,
                Some(edition),
                MatchSource::UserLibrary(kind),
            )));
        }

        let editions = match kind {
            IdentifierType::Asin => self.catalog.search_by_asin(identifier).await?,
            IdentifierType::Isbn => self.catalog.search_by_isbn(identifier).await?,
            IdentifierType::TitleAuthor => Vec::new(),
        };
        let Some(edition) = editions.into_iter().next() else {
            return Ok(None);
        };

        // The edition exists in the catalog; the user may already have the
        // book under a different edition.
        if let Some(book_id) = edition.book_id {
            if let Some(ub) = index.lookup_book(book_id) {
                return Ok(Some(from_user_book(
                    ub,
                    Some(&edition),
                    MatchSource::RemoteSearch(kind),
                )));
            }
        }

        if !self.auto_add {
            return Ok(Some(CatalogMatch {
                user_book_id: None,
                book_id: edition.book_id,
                edition_id: Some(edition.id),
                edition_pages: edition.pages,
                edition_seconds: edition.audio_seconds,
                auto_added: false,
                source: MatchSource::RemoteSearch(kind),
            }));
        }

        let Some(book_id) = edition.book_id else {
            tracing::warn!(identifier, %kind, "edition has no book reference, cannot auto-add");
            return Ok(None);
        };
        let user_book_id = self
            .catalog
            .add_book_to_library(book_id, STATUS_READING, Some(edition.id))
            .await?;
        match user_book_id {
            Some(id) => {
                tracing::info!(book_id, user_book_id = id, "auto-added book to catalog library");
                Ok(Some(CatalogMatch {
                    user_book_id: Some(id),
                    book_id: Some(book_id),
                    edition_id: Some(edition.id),
                    edition_pages: edition.pages,
                    edition_seconds: edition.audio_seconds,
                    auto_added: true,
                    source: MatchSource::RemoteSearch(kind),
                }))
            }
            None => {
                tracing::warn!(book_id, "auto-add returned no user book");
                Ok(None)
            }
        }
    }
}

fn from_user_book(ub: &UserBook, edition: Option<&Edition>, source: MatchSource) -> CatalogMatch {
    CatalogMatch {
        user_book_id: Some(ub.id),
        book_id: ub.book.as_ref().map(|b| b.id),
        edition_id: edition.map(|e| e.id),
        edition_pages: edition.and_then(|e| e.pages),
        edition_seconds: edition.and_then(|e| e.audio_seconds),
        auto_added: false,
        source,
    }
}

fn default_edition(ub: &UserBook) -> Option<&Edition> {
    ub.edition
        .as_ref()
        .or_else(|| ub.book.as_ref().and_then(|b| b.editions.first()))
}
