use std::time::Duration;

use crate::watcher::WatchFeed;

use super::api::ConsulApi;
use super::from_service;

const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Blocking-query loop for one service name. Runs until the feed's session ends.
pub(super) async fn run_watch(api: ConsulApi, name: String, wait: Duration, feed: WatchFeed) {
    let token = feed.token().clone();
    // Zero answers immediately, so the current members are pushed first.
    let mut index: u64 = 0;

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = api.health_service(&name, index, wait) => result,
        };

        let (entries, last_index) = match result {
            // Indexes are always at least 1; a zero would turn this into a busy loop.
            Ok((entries, last_index)) => (entries, last_index.max(1)),
            Err(e) => {
                tracing::warn!(service = %name, error = %e, "consul watch query failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(ERROR_PAUSE) => {}
                }
                continue;
            }
        };

        if last_index == index {
            // Wait elapsed with nothing new.
            continue;
        }
        if last_index < index {
            // Index went backwards (e.g. consul restored from snapshot).
            tracing::debug!(service = %name, index, last_index, "consul index reset");
            index = 0;
            continue;
        }
        index = last_index;

        let members = entries.into_iter().map(|e| from_service(e.service)).collect();
        if !feed.push(members).await {
            return;
        }
    }
}
