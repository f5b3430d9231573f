//! # Background table maintenance
//!
//! Two loops keep the routing table warm:
//!
//! - **Bucket refresh**: periodically looks up a random key inside every
//!   bucket that has seen no refresh past a staleness threshold. The lookup
//!   traffic repopulates the bucket as a side effect.
//! - **Query-self**: periodically looks up the local identifier, which fills
//!   the buckets nearest to us, the ones ordinary traffic reaches last.
//!
//! Both loops are fire-and-forget lookups; their outcomes are irrelevant,
//! only the traffic matters.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::keys::PeerId;
use crate::query::QueryEngine;
use crate::routing::{random_key_in_bucket, BucketInfo, RoutingHandle};
use crate::wire::Message;

/// How often stale buckets are checked.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Idle time after which a bucket is due a refresh.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// How often the self-lookup runs.
pub const DEFAULT_QUERY_SELF_INTERVAL: Duration = Duration::from_secs(60);

/// Parallel bucket lookups during a forced full refresh.
const FORCED_REFRESH_CONCURRENCY: usize = 4;

/// Refresh every stale bucket (or, when `force` is set, every bucket),
/// bounded to a small number of concurrent lookups.
pub async fn refresh_buckets(
    engine: &Arc<QueryEngine>,
    routing: &RoutingHandle,
    threshold: Duration,
    force: bool,
) {
    let buckets = if force {
        routing.buckets().await
    } else {
        routing.stale_buckets(threshold).await
    };
    if buckets.is_empty() {
        return;
    }
    debug!(count = buckets.len(), force, "refreshing routing buckets");

    let mut lookups = JoinSet::new();
    let mut pending = buckets.into_iter();
    loop {
        while lookups.len() < FORCED_REFRESH_CONCURRENCY {
            let Some(bucket) = pending.next() else { break };
            lookups.spawn(refresh_one(engine.clone(), routing.clone(), bucket));
        }
        if lookups.join_next().await.is_none() {
            break;
        }
    }
}

async fn refresh_one(engine: Arc<QueryEngine>, routing: RoutingHandle, bucket: BucketInfo) {
    let target = random_key_in_bucket(&bucket);
    trace!(depth = bucket.depth, target = %target, "bucket refresh lookup");

    let abort = CancellationToken::new();
    let run = engine
        .run(target, Message::find_node(target.as_bytes().to_vec()), &abort)
        .await;
    run.drain().await;

    // Refreshed regardless of whether the lookup found anything.
    routing.mark_refreshed(&target).await;
}

/// Periodic stale-bucket refresh until cancelled.
pub fn spawn_refresh_loop(
    engine: Arc<QueryEngine>,
    routing: RoutingHandle,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    refresh_buckets(&engine, &routing, threshold, false).await;
                }
            }
        }
    })
}

/// Periodic self-lookup until cancelled.
pub fn spawn_query_self_loop(
    engine: Arc<QueryEngine>,
    local_peer: PeerId,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    trace!("query-self lookup");
                    let abort = CancellationToken::new();
                    let run = engine
                        .run(
                            local_peer.routing_key(),
                            Message::find_node(local_peer.as_bytes().to_vec()),
                            &abort,
                        )
                        .await;
                    run.drain().await;
                }
            }
        }
    })
}
