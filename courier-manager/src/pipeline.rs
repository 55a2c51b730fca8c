//! Per-campaign producer.
//!
//! One task per running campaign: fetch the next subscriber batch, render a
//! message for each, and enqueue them on the shared channel. The bounded
//! channel provides backpressure; the runtime's cancellation token and
//! paused flag are observed between batches and between messages.

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use tracing::error;

use crate::{CampaignRuntime, Inner, Job};

/// Consecutive subscriber-fetch failures tolerated before the campaign is
/// cancelled with reason "store-error".
const STORE_FAILURE_LIMIT: u32 = 3;

pub(crate) async fn produce(inner: Arc<Inner>, runtime: Arc<CampaignRuntime>) {
    let batch_size = inner.config.batch_size;
    let mut cursor = runtime.cursor.load(Ordering::SeqCst);
    let mut store_failures: u32 = 0;

    loop {
        if runtime.cancel.is_cancelled() {
            return;
        }

        // Paused: hold production, keep observing cancellation. The sleep
        // arm covers a resume notification racing the flag check.
        while runtime.paused() {
            tokio::select! {
                () = runtime.cancel.cancelled() => return,
                () = runtime.resume.notified() => {}
                () = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }

        let subscribers = match inner
            .store
            .next_subscribers(runtime.id, cursor, batch_size)
            .await
        {
            Ok(subscribers) => {
                store_failures = 0;
                subscribers
            }
            Err(e) => {
                store_failures += 1;
                error!(
                    campaign_id = runtime.id,
                    attempt = store_failures,
                    error = %e,
                    "error fetching subscribers"
                );
                if store_failures >= STORE_FAILURE_LIMIT {
                    inner.cancel_campaign_runtime(&runtime, "store-error").await;
                    return;
                }
                tokio::select! {
                    () = runtime.cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }
        };

        let fetched = subscribers.len();
        for subscriber in subscribers {
            if runtime.cancel.is_cancelled() {
                return;
            }

            cursor = subscriber.id;
            let message = match runtime.compiled.render(&subscriber) {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        campaign_id = runtime.id,
                        subscriber_id = subscriber.id,
                        error = %e,
                        "render failure"
                    );
                    inner.cancel_campaign_runtime(&runtime, "render-error").await;
                    return;
                }
            };

            runtime.in_flight.fetch_add(1, Ordering::SeqCst);
            runtime.enqueued.fetch_add(1, Ordering::SeqCst);
            runtime.cursor.store(cursor, Ordering::SeqCst);

            let job = Job {
                message,
                campaign_id: Some(runtime.id),
            };
            let enqueue = tokio::select! {
                () = runtime.cancel.cancelled() => Err(()),
                sent = inner.tx.send(job) => sent.map_err(|_| ()),
            };
            if enqueue.is_err() {
                // Cancelled while waiting on a full channel, or the engine
                // stopped and closed it.
                runtime.in_flight.fetch_sub(1, Ordering::SeqCst);
                runtime.enqueued.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }

        // The whole batch is on the channel; record it for the completion
        // watermark the persisted cursor is derived from.
        if fetched > 0 {
            runtime
                .batch_marks
                .lock()
                .push_back((runtime.enqueued.load(Ordering::SeqCst), cursor));
        }

        // A short batch means the audience is exhausted: close production
        // and let the drain of in-flight messages finish the campaign.
        if fetched < batch_size {
            runtime.exhausted.store(true, Ordering::SeqCst);
            inner.maybe_finish(&runtime).await;
            return;
        }
    }
}
