//! Shared worker pool.
//!
//! A fixed number of workers drain the shared channel: acquire a rate
//! token, resolve the messenger, dispatch, and classify the outcome. Low
//! level transport errors never leave this boundary; campaigns only see
//! counted transients, skipped permanents, and threshold cancellations.

use std::sync::{atomic::Ordering, Arc};

use tracing::{error, warn};

use crate::{CampaignRuntime, Inner, Job};

pub(crate) async fn worker_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            job = inner.rx.recv() => match job {
                Ok(job) => handle(&inner, job).await,
                Err(_) => break,
            }
        }
    }
}

async fn handle(inner: &Arc<Inner>, mut job: Job) {
    let runtime = job
        .campaign_id
        .and_then(|id| inner.runtimes.get(&id).map(|entry| Arc::clone(entry.value())));

    // Messages queued behind a cancellation are dropped without burning a
    // rate token; only sends already in flight at that moment complete.
    if job.campaign_id.is_some()
        && runtime
            .as_ref()
            .is_none_or(|runtime| runtime.cancel.is_cancelled())
    {
        finish_one(inner, runtime.as_ref()).await;
        return;
    }

    // A worker blocked on the limiter aborts on shutdown without consuming
    // a token; the message is dropped, which at-least-once allows.
    if inner.limiter.acquire(&inner.cancel).await.is_err() {
        finish_one(inner, runtime.as_ref()).await;
        return;
    }

    let Some(messenger) = inner.registry.get(&job.message.messenger) else {
        error!(
            messenger = %job.message.messenger,
            to = ?job.message.to,
            "no such messenger; dropping message"
        );
        finish_one(inner, runtime.as_ref()).await;
        return;
    };

    match messenger.push(&job.message).await {
        Ok(()) => {
            if let Some(runtime) = &runtime {
                let buffered = runtime.buffered_sent.fetch_add(1, Ordering::SeqCst) + 1;
                if buffered >= inner.config.batch_size as u64 {
                    inner.flush_and_police(runtime).await;
                }
            }
        }
        Err(e) if e.is_permanent() => {
            // Bad addressing is logged against the recipient and skipped;
            // it does not count toward the campaign's error threshold.
            error!(
                to = ?job.message.to,
                messenger = %job.message.messenger,
                error = %e,
                "permanent delivery failure"
            );
        }
        Err(e) => {
            warn!(
                to = ?job.message.to,
                messenger = %job.message.messenger,
                error = %e,
                "transient delivery failure"
            );

            if let Some(runtime) = &runtime {
                let errors = runtime.errors.fetch_add(1, Ordering::SeqCst) + 1;
                let threshold = inner.config.max_send_errors;
                if threshold > 0 && errors >= threshold {
                    inner
                        .cancel_campaign_runtime(runtime, "error-threshold")
                        .await;
                } else if job.message.retries < inner.config.max_retries {
                    job.message.retries += 1;
                    // Requeued without releasing the in-flight slot. A full
                    // queue drops the message instead of blocking the pool.
                    if inner.tx.try_send(job).is_ok() {
                        return;
                    }
                    warn!("queue full; dropping message after transient failure");
                }
            } else if job.message.retries < inner.config.max_retries {
                job.message.retries += 1;
                if inner.tx.try_send(job).is_ok() {
                    return;
                }
            }
        }
    }

    finish_one(inner, runtime.as_ref()).await;
}

/// Release the in-flight slot and run the finish check.
async fn finish_one(inner: &Arc<Inner>, runtime: Option<&Arc<CampaignRuntime>>) {
    if let Some(runtime) = runtime {
        runtime.completed.fetch_add(1, Ordering::SeqCst);
        runtime.in_flight.fetch_sub(1, Ordering::SeqCst);
        inner.maybe_finish(runtime).await;
    }
}
