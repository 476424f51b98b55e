//! Batched concurrent delivery.
//!
//! Emails go out in sub-batches of at most `max_batch_size`. Every email in
//! a sub-batch is sent concurrently and the sub-batch is joined before the
//! next one starts, with a fixed pause in between. Each email retries on
//! failure with linear backoff; each task owns its own result.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;
use crate::transport::{EmailTransport, OutgoingEmail, SendReceipt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchPolicy {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub batch_pause: Duration,
    pub retry_backoff: Duration,
    pub send_timeout: Duration,
}

impl DispatchPolicy {
    /// `requested_batch_size` is clamped to `1..=max_batch_size`.
    /// Without retry every email gets exactly one attempt.
    pub fn new(config: &DispatchConfig, requested_batch_size: usize, retry: bool) -> Self {
        Self {
            batch_size: requested_batch_size.clamp(1, config.max_batch_size.max(1)),
            max_attempts: if retry { config.max_attempts.max(1) } else { 1 },
            batch_pause: Duration::from_millis(config.batch_pause_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }
}

/// Final outcome for one email after all its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub outcome: Result<SendReceipt, String>,
    pub attempts: u32,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmailSendingSummary {
    /// Emails handed to the transport.
    pub total_attempts: usize,
    pub successful_sends: usize,
    pub failed_sends: usize,
    /// Attempts beyond the first, summed over all emails.
    pub retry_attempts: usize,
    pub send_duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Same order as the input emails.
    pub deliveries: Vec<Delivery>,
    pub summary: EmailSendingSummary,
}

/// Send one email, retrying up to `policy.max_attempts` times.
/// Attempt `n` that fails waits `n * retry_backoff` before the next one.
pub async fn send_with_retry(
    transport: &dyn EmailTransport,
    email: &OutgoingEmail,
    policy: &DispatchPolicy,
) -> Delivery {
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        match tokio::time::timeout(policy.send_timeout, transport.send_message(email)).await {
            Ok(Ok(receipt)) => {
                log::info!(
                    "sent to {} (message {}, attempt {attempt})",
                    email.to,
                    receipt.message_id
                );
                return Delivery {
                    outcome: Ok(receipt),
                    attempts: attempt,
                };
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!(
                    "send to {} timed out after {}s",
                    email.to,
                    policy.send_timeout.as_secs()
                )
            }
        }
        log::warn!(
            "send to {} failed (attempt {attempt}/{}): {last_error}",
            email.to,
            policy.max_attempts
        );
        if attempt < policy.max_attempts {
            let wait = policy.retry_backoff * attempt;
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
    Delivery {
        outcome: Err(last_error),
        attempts: policy.max_attempts,
    }
}

/// Deliver every email and report outcomes in input order.
pub async fn dispatch_all(
    transport: Arc<dyn EmailTransport>,
    emails: Vec<OutgoingEmail>,
    policy: DispatchPolicy,
) -> DispatchReport {
    let started = Instant::now();
    let total = emails.len();
    let mut deliveries: Vec<Delivery> = Vec::with_capacity(total);

    log::info!(
        "dispatching {total} emails in batches of {}",
        policy.batch_size
    );

    let mut pending = emails.into_iter().peekable();
    while pending.peek().is_some() {
        let handles: Vec<_> = pending
            .by_ref()
            .take(policy.batch_size)
            .map(|email| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { send_with_retry(transport.as_ref(), &email, &policy).await })
            })
            .collect();

        for handle in handles {
            let delivery = handle.await.unwrap_or_else(|e| Delivery {
                outcome: Err(format!("send task aborted: {e}")),
                attempts: 0,
            });
            deliveries.push(delivery);
        }

        if pending.peek().is_some() && !policy.batch_pause.is_zero() {
            tokio::time::sleep(policy.batch_pause).await;
        }
    }

    let successful_sends = deliveries.iter().filter(|d| d.is_sent()).count();
    let summary = EmailSendingSummary {
        total_attempts: total,
        successful_sends,
        failed_sends: total - successful_sends,
        retry_attempts: deliveries
            .iter()
            .map(|d| d.attempts.saturating_sub(1) as usize)
            .sum(),
        send_duration_seconds: started.elapsed().as_secs_f64(),
    };
    log::info!(
        "dispatch finished: {} sent, {} failed, {} retries",
        summary.successful_sends,
        summary.failed_sends,
        summary.retry_attempts
    );
    DispatchReport {
        deliveries,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_capped_and_retry_flag_respected() {
        let cfg = DispatchConfig::default();
        let p = DispatchPolicy::new(&cfg, 50, true);
        assert_eq!(p.batch_size, 10);
        assert_eq!(p.max_attempts, 3);
        let p = DispatchPolicy::new(&cfg, 0, false);
        assert_eq!(p.batch_size, 1);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(DispatchPolicy::new(&cfg, 4, true).batch_size, 4);
    }
}
