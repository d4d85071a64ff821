use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

/// Tag marking a feed as an OPML subscription list.
pub const TAG_LIST: &str = "list";
/// Tag marking a feed as derived from some list rather than configured directly.
pub const TAG_FROM_LIST: &str = "from-list";
/// Prefix of provenance tags: `from-list:<list-url>`.
pub const FROM_LIST_PREFIX: &str = "from-list:";
/// Transient sweep marker, set at the start of a reconciliation cycle and
/// cleared when any list re-confirms the feed.
pub const TAG_NOT_IN_LIST: &str = "not-in-list-anymore";

/// Builds the provenance tag for a given list URL.
pub fn provenance_tag(list_url: &str) -> String {
    format!("{FROM_LIST_PREFIX}{list_url}")
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub updates_disabled: bool,
    pub last_fetched: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Entry {
    pub feed_url: String,
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<String>,
}

/// Sqlite-backed feed and tag store. Tags are the only state-tracking
/// mechanism; deleting a feed drops its tags and entries with it.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY,
                title TEXT,
                link TEXT,
                updates_disabled INTEGER DEFAULT 0,
                last_fetched TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_tags (
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                UNIQUE(feed_url, tag)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT,
                link TEXT,
                published TEXT,
                UNIQUE(feed_url, guid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_feed_tags_tag
            ON feed_tags(tag)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Adds a feed. Adding an already-tracked URL is a no-op.
    pub async fn add_feed(&self, url: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO feeds (url) VALUES (?)")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes a feed together with its tags and entries.
    pub async fn delete_feed(&self, url: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_feed(&self, url: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn add_tag(&self, url: &str, tag: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO feed_tags (feed_url, tag) VALUES (?, ?)")
            .bind(url)
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_tag(&self, url: &str, tag: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM feed_tags WHERE feed_url = ? AND tag = ?")
            .bind(url)
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn tags_for_feed(&self, url: &str) -> anyhow::Result<Vec<String>> {
        let tags: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM feed_tags WHERE feed_url = ? ORDER BY tag")
                .bind(url)
                .fetch_all(&self.pool)
                .await?;
        Ok(tags.into_iter().map(|(tag,)| tag).collect())
    }

    /// Feeds carrying *all* of the given tags.
    pub async fn feeds_with_tags(&self, tags: &[&str]) -> anyhow::Result<Vec<Feed>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = sqlx::QueryBuilder::new(
            "SELECT f.url, f.title, f.link, f.updates_disabled, f.last_fetched, f.last_error \
             FROM feeds f JOIN feed_tags t ON t.feed_url = f.url WHERE t.tag IN (",
        );
        let mut separated = qb.separated(", ");
        for tag in tags {
            separated.push_bind(*tag);
        }
        qb.push(") GROUP BY f.url HAVING COUNT(DISTINCT t.tag) = ");
        qb.push_bind(tags.len() as i64);
        qb.push(" ORDER BY f.url");

        let feeds = qb.build_query_as::<Feed>().fetch_all(&self.pool).await?;
        Ok(feeds)
    }

    /// Feeds carrying any tag starting with `prefix`. Uses substr rather
    /// than LIKE so that `%` and `_` in URLs need no escaping.
    pub async fn feeds_with_tag_prefix(&self, prefix: &str) -> anyhow::Result<Vec<Feed>> {
        let len = prefix.chars().count() as i64;
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT DISTINCT f.url, f.title, f.link, f.updates_disabled, f.last_fetched, f.last_error
            FROM feeds f JOIN feed_tags t ON t.feed_url = f.url
            WHERE substr(t.tag, 1, ?) = ?
            ORDER BY f.url
            "#,
        )
        .bind(len)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// List URLs recorded in the feed's provenance tags, lexicographically
    /// ordered. The stripped URL comes back typed so callers never have to
    /// pattern-match tag strings.
    pub async fn provenance_lists(&self, url: &str) -> anyhow::Result<Vec<String>> {
        let prefix_len = FROM_LIST_PREFIX.chars().count() as i64;
        let lists: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT substr(tag, ? + 1) FROM feed_tags
            WHERE feed_url = ? AND substr(tag, 1, ?) = ?
            ORDER BY tag
            "#,
        )
        .bind(prefix_len)
        .bind(url)
        .bind(prefix_len)
        .bind(FROM_LIST_PREFIX)
        .fetch_all(&self.pool)
        .await?;
        Ok(lists.into_iter().map(|(url,)| url).collect())
    }

    /// Excludes the feed from the content-update pass (used for list feeds,
    /// which are resolved for membership instead of fetched for content).
    pub async fn disable_updates(&self, url: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE feeds SET updates_disabled = 1 WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY url")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    /// Feeds subject to the content-update pass.
    pub async fn feeds_to_update(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT * FROM feeds WHERE updates_disabled = 0 ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn set_feed_meta(
        &self,
        url: &str,
        title: Option<&str>,
        link: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET title = COALESCE(?, title), link = COALESCE(?, link)
            WHERE url = ?
            "#,
        )
        .bind(title)
        .bind(link)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_fetched(&self, url: &str, error: Option<&str>) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE feeds SET last_fetched = ?, last_error = ? WHERE url = ?")
            .bind(&now)
            .bind(error)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stores an entry, refreshing its metadata if the guid is already
    /// known. Returns true when the entry is new for this feed.
    pub async fn upsert_entry(
        &self,
        feed_url: &str,
        guid: &str,
        title: Option<&str>,
        link: Option<&str>,
        published: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let known: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM entries WHERE feed_url = ? AND guid = ?")
                .bind(feed_url)
                .bind(guid)
                .fetch_optional(&self.pool)
                .await?;

        let published_str = published.map(|p| p.to_rfc3339());
        sqlx::query(
            r#"
            INSERT INTO entries (feed_url, guid, title, link, published)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(feed_url, guid) DO UPDATE SET
                title = excluded.title,
                link = excluded.link,
                published = excluded.published
            "#,
        )
        .bind(feed_url)
        .bind(guid)
        .bind(title)
        .bind(link)
        .bind(published_str)
        .execute(&self.pool)
        .await?;

        Ok(known.is_none())
    }

    pub async fn recent_entries(&self, feed_url: &str, limit: i64) -> anyhow::Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT * FROM entries
            WHERE feed_url = ?
            ORDER BY published DESC NULLS LAST, guid
            LIMIT ?
            "#,
        )
        .bind(feed_url)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}
