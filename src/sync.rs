use std::collections::HashSet;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::FeedAction;
use crate::opml;
use crate::store::{provenance_tag, Store, TAG_FROM_LIST, TAG_LIST, TAG_NOT_IN_LIST};

/// Registers every configured subscription. Runs once at startup; feeds
/// that already exist are left untouched.
pub async fn register_feeds(store: &Store, actions: &[FeedAction]) -> anyhow::Result<()> {
    for action in actions {
        if action.is_list() {
            add_list(store, &action.feed_url).await?;
        } else {
            store.add_feed(&action.feed_url).await?;
        }
    }
    Ok(())
}

/// Registers an OPML list. Idempotent: add, tag, disable content updates.
pub async fn add_list(store: &Store, url: &str) -> anyhow::Result<()> {
    store.add_feed(url).await?;
    store.add_tag(url, TAG_LIST).await?;
    // not a real feed, so no content updates
    store.disable_updates(url).await?;
    Ok(())
}

/// Deregisters a list: every feed derived from it goes first, then the
/// list feed itself. Administrative, not part of the reconciliation cycle.
pub async fn delete_list(store: &Store, url: &str) -> anyhow::Result<()> {
    let tag = provenance_tag(url);
    for feed in store.feeds_with_tags(&[tag.as_str()]).await? {
        info!("Deleting feed '{}' derived from list '{}'", feed.url, url);
        store.delete_feed(&feed.url).await?;
    }
    store.delete_feed(url).await?;
    Ok(())
}

/// Brings the list-derived feed population in line with the current
/// membership of every registered list.
///
/// Mark-and-sweep over tags: every list-derived feed is first marked as a
/// removal candidate, each list's current members are then (re-)added and
/// unmarked, and whatever stays marked was dropped from all of its lists
/// and is deleted — unless it is also configured directly, in which case
/// it is demoted back to a plain feed. Safe to re-run at any point; an
/// interrupted cycle is simply corrected by the next one.
pub async fn reconcile_lists(
    store: &Store,
    client: &Client,
    actions: &[FeedAction],
) -> anyhow::Result<()> {
    let direct_urls: HashSet<&str> = actions
        .iter()
        .filter(|a| !a.is_list())
        .map(|a| a.feed_url.as_str())
        .collect();

    for feed in store.feeds_with_tags(&[TAG_FROM_LIST]).await? {
        store.add_tag(&feed.url, TAG_NOT_IN_LIST).await?;
    }

    for list in store.feeds_with_tags(&[TAG_LIST]).await? {
        let members = match opml::resolve_members(client, &list.url).await {
            Ok(members) => members,
            Err(e) => {
                warn!("Skipping list '{}' this cycle: {}", list.url, e);
                // The mark phase flagged this list's members; an unresolved
                // list neither confirms nor denies membership, so clear the
                // marks rather than let the delete phase evict them.
                let list_tag = provenance_tag(&list.url);
                for feed in store.feeds_with_tags(&[list_tag.as_str()]).await? {
                    store.remove_tag(&feed.url, TAG_NOT_IN_LIST).await?;
                }
                continue;
            }
        };

        info!("List '{}' has {} members", list.url, members.len());
        for member in &members {
            store.add_feed(&member.feed_url).await?;
            store.add_tag(&member.feed_url, TAG_FROM_LIST).await?;
            store
                .add_tag(&member.feed_url, &provenance_tag(&list.url))
                .await?;
            store.remove_tag(&member.feed_url, TAG_NOT_IN_LIST).await?;
        }

        // Provenance for this list must mirror its current membership;
        // drop stale records for feeds the list no longer mentions.
        let member_set: HashSet<&str> = members.iter().map(|m| m.feed_url.as_str()).collect();
        let list_tag = provenance_tag(&list.url);
        for feed in store.feeds_with_tags(&[list_tag.as_str()]).await? {
            if !member_set.contains(feed.url.as_str()) {
                store.remove_tag(&feed.url, &list_tag).await?;
            }
        }
    }

    for feed in store
        .feeds_with_tags(&[TAG_FROM_LIST, TAG_NOT_IN_LIST])
        .await?
    {
        if direct_urls.contains(feed.url.as_str()) {
            // Dropped from every list but still independently configured:
            // it stays tracked as a plain direct feed.
            info!("Feed '{}' left its lists but is configured, keeping", feed.url);
            store.remove_tag(&feed.url, TAG_FROM_LIST).await?;
            store.remove_tag(&feed.url, TAG_NOT_IN_LIST).await?;
            continue;
        }
        info!("Feed '{}' is no longer in any list, deleting", feed.url);
        store.delete_feed(&feed.url).await?;
    }

    Ok(())
}
