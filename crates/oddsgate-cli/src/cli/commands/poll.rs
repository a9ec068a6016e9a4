//! Queued polling command.

use std::time::Duration;

use console::style;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use oddsgate::{FeedService, JobEvent, JobKind, Settings};

use crate::cli::icons::{dim_arrow, error, success, warn};

pub struct PollOptions {
    pub kind: JobKind,
    pub ids: Vec<String>,
    pub interval: Duration,
    pub rounds: u32,
    pub priority: Option<i32>,
}

/// Enqueue every id once per round, then wait for the queue to drain.
pub async fn cmd_poll(settings: Settings, options: PollOptions, json: bool) -> anyhow::Result<()> {
    let service = FeedService::start(settings)?;

    let mut events = service.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::Completed { kind, attempts, .. }) => {
                    eprintln!("{} {} completed ({} attempt(s))", success(), kind, attempts);
                }
                Ok(JobEvent::Retrying {
                    kind, delay, error, ..
                }) => {
                    eprintln!("{} {} retrying in {:?}: {}", warn(), kind, delay, error);
                }
                Ok(JobEvent::Failed { kind, error: e, .. }) => {
                    eprintln!("{} {} failed: {}", error(), kind, e);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("{} {} events skipped", dim_arrow(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for round in 1..=options.rounds {
        let mut rejected = 0;
        for id in &options.ids {
            if let Err(e) = service.enqueue(options.kind, id, options.priority) {
                eprintln!("{} {}:{} not queued: {}", error(), options.kind, id, e);
                rejected += 1;
            }
        }
        eprintln!(
            "{} Round {}/{}: queued {} job(s){}",
            dim_arrow(),
            round,
            options.rounds,
            options.ids.len() - rejected,
            if rejected > 0 {
                format!(", {} rejected", rejected)
            } else {
                String::new()
            }
        );

        if round < options.rounds {
            tokio::time::sleep(options.interval).await;
        }
    }

    service.queue().wait_idle().await;
    service.shutdown(true).await;
    printer.abort();

    let queue = service.queue_status();
    let stats = service.stats();
    let limiter = service.rate_limiter_status(None);

    if json {
        let report = json!({
            "queue": queue,
            "gateway": stats,
            "rate_limiter": limiter,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", style("Queue").bold());
    println!(
        "  processed {}, failed {}, retried {}, mean wait {:.0}ms",
        queue.stats.total_processed,
        queue.stats.total_failed,
        queue.stats.total_retried,
        queue.stats.average_wait_ms
    );
    println!("{}", style("Gateway").bold());
    println!(
        "  {} calls: {} ok, {} failed, {} rate limited, {} retried, avg {:.0}ms",
        stats.total_calls,
        stats.successful_calls,
        stats.failed_calls,
        stats.rate_limited_calls,
        stats.retried_calls,
        stats.average_response_time_ms
    );
    println!("{}", style("Rate limiter").bold());
    for (endpoint, status) in &limiter {
        println!(
            "  {:<18} {}/{} in window, {} hits{}",
            endpoint,
            status.window_count,
            status.max_requests,
            status.rate_limit_hits,
            if status.in_backoff {
                format!(", backing off {}ms", status.backoff_remaining_ms)
            } else {
                String::new()
            }
        );
    }

    if queue.stats.total_failed > 0 {
        anyhow::bail!("{} job(s) failed", queue.stats.total_failed);
    }
    Ok(())
}
