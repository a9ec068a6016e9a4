//! Direct fetch command.

use console::style;
use serde_json::json;

use oddsgate::{FeedService, JobKind, JobPayload, Settings};

use crate::cli::icons::{dim_arrow, error, success};

/// Fetch one resource through the gateway and print it.
pub async fn cmd_fetch(settings: Settings, kind: JobKind, id: &str, json: bool) -> anyhow::Result<()> {
    let service = FeedService::start(settings)?;
    let payload = JobPayload::new(kind, id);

    let result = service.fetch_now(&payload).await;
    let retry_count = result.retry_count;
    let response_time = result.response_time;
    let outcome = result.into_result();
    service.shutdown(false).await;

    let data = match outcome {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{} {} failed: {}", error(), payload, e);
            if let Some(status) = e.status_code() {
                eprintln!("  {} HTTP status {}", dim_arrow(), status);
            }
            anyhow::bail!("fetch of {} failed", payload);
        }
    };

    if json {
        let report = json!({
            "payload": payload,
            "data": data,
            "retry_count": retry_count,
            "response_time_ms": response_time.as_millis() as u64,
            "stats": service.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&data)?);
        eprintln!(
            "{} {} in {}ms{}",
            success(),
            style(&payload).bold(),
            response_time.as_millis(),
            if retry_count > 0 {
                format!(" after {} retries", retry_count)
            } else {
                String::new()
            }
        );
    }

    Ok(())
}
