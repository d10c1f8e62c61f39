use std::time::Duration;

use etcd_client::{Client, GetOptions, WatchOptions};

use crate::error::{Error, Result};
use crate::instance::ServiceInstance;
use crate::watcher::WatchFeed;

use super::decode_record;

const RESUBSCRIBE_PAUSE: Duration = Duration::from_secs(1);

/// Watch loop for one service prefix. Runs until the feed's session ends.
pub(super) async fn run_watch(client: Client, prefix: String, feed: WatchFeed) {
    let token = feed.token().clone();
    loop {
        match watch_session(&client, &prefix, &feed).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(prefix = %prefix, error = %e, "etcd watch interrupted, resubscribing");
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_PAUSE) => {}
        }
    }
}

/// One subscription: push a snapshot, then stream changes from its revision.
/// `Ok(())` means the session ended and the loop must not resubscribe.
async fn watch_session(client: &Client, prefix: &str, feed: &WatchFeed) -> Result<()> {
    let token = feed.token();
    let (members, revision) = snapshot(client, prefix).await?;

    let options = WatchOptions::new()
        .with_prefix()
        .with_start_revision(revision + 1);
    let mut stream = client.clone().watch(prefix, Some(options)).await?;
    tracing::debug!(prefix, revision, "etcd watch established");

    // Members as of `revision`; the stream carries everything after it.
    if !feed.push(members).await {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = stream.message() => {
                let resp = msg?.ok_or(Error::WatcherStopped)?;
                if resp.canceled() {
                    // Usually a compacted start revision; start over from a fresh snapshot.
                    return Err(Error::WatchCancelled);
                }
                if resp.events().is_empty() {
                    continue;
                }
                let (members, _) = snapshot(client, prefix).await?;
                if !feed.push(members).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Current members under `prefix` and the store revision they were read at.
/// Records that fail to decode are skipped so one bad writer cannot blind
/// every watcher.
async fn snapshot(client: &Client, prefix: &str) -> Result<(Vec<ServiceInstance>, i64)> {
    let resp = client
        .clone()
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or_default();

    let members = resp
        .kvs()
        .iter()
        .filter_map(|kv| match decode_record(kv) {
            Ok(instance) => Some(instance),
            Err(e) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %e,
                    "skipping undecodable registry record"
                );
                None
            }
        })
        .collect();
    Ok((members, revision))
}
