use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::FeedAction;
use crate::fetcher::{FeedRecord, FeedUpdate, UpdateStatus};
use crate::store::{Store, TAG_FROM_LIST};

/// Resolves updated feeds to their configured actions and runs them.
///
/// The action map is built once from configuration and never changes for
/// the lifetime of the process.
pub struct Dispatcher {
    actions: HashMap<String, FeedAction>,
}

impl Dispatcher {
    pub fn new(actions: &[FeedAction]) -> Self {
        let actions = actions
            .iter()
            .map(|a| (a.feed_url.clone(), a.clone()))
            .collect();
        Self { actions }
    }

    /// Consumes one update pass: unchanged and failed feeds are reported,
    /// updated feeds are traced back to their owning action(s) and each
    /// action is invoked once with the feed's record.
    pub async fn dispatch_updates(
        &self,
        store: &Store,
        updates: &[FeedUpdate],
    ) -> anyhow::Result<()> {
        for update in updates {
            match &update.status {
                UpdateStatus::NotModified => {
                    info!("{} not modified", update.url);
                }
                UpdateStatus::Failed(e) => {
                    warn!("{} error: {}", update.url, e);
                }
                UpdateStatus::Updated(record) => {
                    for action in self.resolve_actions(store, &update.url).await? {
                        run_action(action, record).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finds the action(s) owning a feed.
    ///
    /// A list-derived feed dispatches to every list action that currently
    /// has provenance on it, deduplicated by command, in lexicographic
    /// list-URL order. A directly-tracked feed dispatches to the action
    /// registered for its own URL. Feeds with no registered action, and
    /// `from-list` feeds with no provenance record, resolve to nothing.
    pub async fn resolve_actions(
        &self,
        store: &Store,
        url: &str,
    ) -> anyhow::Result<Vec<&FeedAction>> {
        let tags = store.tags_for_feed(url).await?;

        if !tags.iter().any(|t| t == TAG_FROM_LIST) {
            return Ok(self.actions.get(url).into_iter().collect());
        }

        let mut seen_cmds = HashSet::new();
        let mut resolved = Vec::new();
        for list_url in store.provenance_lists(url).await? {
            if let Some(action) = self.actions.get(&list_url) {
                if seen_cmds.insert(action.cmd.clone()) {
                    resolved.push(action);
                }
            }
        }
        Ok(resolved)
    }
}

/// Runs one action with the feed record as JSON on its stdin. Failures
/// are logged and swallowed; a broken action never stops the cycle.
pub async fn run_action(action: &FeedAction, record: &FeedRecord) {
    info!("Running action '{}' for feed '{}'", action.cmd, record.url);

    let payload = match serde_json::to_vec(record) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to serialize record for '{}': {}", record.url, e);
            return;
        }
    };

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&action.cmd)
        .stdin(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn action '{}': {}", action.cmd, e);
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&payload).await {
            warn!("Failed to write record to action '{}': {}", action.cmd, e);
        }
        // Closing stdin lets the child see EOF
        drop(stdin);
    }

    match child.wait().await {
        Ok(status) if !status.success() => {
            warn!("Action '{}' exited with {}", action.cmd, status);
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Failed to wait for action '{}': {}", action.cmd, e);
        }
    }
}
