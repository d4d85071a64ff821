use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::{Feed, Store};

/// The refreshed record of a feed that gained new entries, handed to the
/// dispatcher and ultimately serialized onto an action's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct FeedRecord {
    pub url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub new_entries: Vec<EntryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryRecord {
    pub id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Per-feed outcome of one update pass.
#[derive(Debug)]
pub enum UpdateStatus {
    NotModified,
    Failed(String),
    Updated(FeedRecord),
}

#[derive(Debug)]
pub struct FeedUpdate {
    pub url: String,
    pub status: UpdateStatus,
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("rss-actions/0.1 (feed poller)")
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    /// The HTTP client, shared with the list resolver.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fetches every tracked, update-enabled feed and classifies the
    /// result. Failures are recorded on the feed row and reported in the
    /// returned vector; they never abort the pass.
    pub async fn update_feeds(&self, store: &Store) -> anyhow::Result<Vec<FeedUpdate>> {
        let feeds = store.feeds_to_update().await?;
        info!("Updating {} feeds", feeds.len());

        let mut updates = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let status = match self.refresh_feed(store, &feed).await {
                Ok(Some(record)) => {
                    store.mark_fetched(&feed.url, None).await?;
                    UpdateStatus::Updated(record)
                }
                Ok(None) => {
                    store.mark_fetched(&feed.url, None).await?;
                    UpdateStatus::NotModified
                }
                Err(e) => {
                    warn!("Failed to update feed '{}': {}", feed.url, e);
                    store.mark_fetched(&feed.url, Some(&e.to_string())).await?;
                    UpdateStatus::Failed(e.to_string())
                }
            };
            updates.push(FeedUpdate {
                url: feed.url,
                status,
            });
        }

        Ok(updates)
    }

    /// Fetches and parses one feed, storing its entries. Returns the
    /// refreshed record when at least one entry was new, `None` when
    /// nothing changed.
    async fn refresh_feed(&self, store: &Store, feed: &Feed) -> anyhow::Result<Option<FeedRecord>> {
        let response = self.client.get(&feed.url).send().await?;
        let bytes = response.error_for_status()?.bytes().await?;

        let parsed = parser::parse(&bytes[..])?;

        let title = parsed.title.as_ref().map(|t| t.content.clone());
        let link = parsed.links.first().map(|l| l.href.clone());
        store
            .set_feed_meta(&feed.url, title.as_deref(), link.as_deref())
            .await?;

        let mut new_entries = Vec::new();
        for entry in parsed.entries {
            let entry_title = entry.title.as_ref().map(|t| t.content.clone());
            let entry_link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);

            let is_new = store
                .upsert_entry(
                    &feed.url,
                    &entry.id,
                    entry_title.as_deref(),
                    entry_link.as_deref(),
                    published,
                )
                .await?;

            if is_new {
                new_entries.push(EntryRecord {
                    id: entry.id,
                    title: entry_title,
                    link: entry_link,
                    published,
                });
            }
        }

        if new_entries.is_empty() {
            return Ok(None);
        }

        info!("{} new entries for feed '{}'", new_entries.len(), feed.url);
        Ok(Some(FeedRecord {
            url: feed.url.clone(),
            title,
            link,
            new_entries,
        }))
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}
