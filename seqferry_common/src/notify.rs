//! Formatting and posting upload notifications.
//!
//! One message per outcome kind per invocation, posted fire-and-forget to a
//! Slack-style webhook. A failed post is logged and never retried; the
//! upload itself has already been recorded durably by the state log.

use std::time::Duration;

use crate::prelude::*;

/// How long to wait on the webhook endpoint before giving up.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Format the summary message for a set of uploaded and failed runs.
///
/// Empty inputs yield an empty string, which callers should not post.
pub fn format_message(completed: &[String], failed: &[String]) -> String {
    let mut message = String::new();

    if !completed.is_empty() {
        message.push_str(&format!(
            ":white_check_mark: S3 Upload: Successfully uploaded {} runs",
            completed.len()
        ));
        for run_id in completed {
            message.push_str(&format!("\n\t:black_square: {}", run_id));
        }
    }

    if !failed.is_empty() {
        if !message.is_empty() {
            message.push_str("\n\n");
        }
        message.push_str(&format!(
            ":x: S3 Upload: Failed uploading {} runs",
            failed.len()
        ));
        for run_id in failed {
            message.push_str(&format!("\n\t:black_square: {}", run_id));
        }
    }

    message
}

/// Post a message to a webhook URL.
///
/// Failures are logged and swallowed; notifications must never fail an
/// otherwise-successful invocation.
#[instrument(skip_all)]
pub async fn post_message(url: &str, message: &str) {
    info!("posting notification message");

    let client = match reqwest::Client::builder().timeout(POST_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            error!("could not construct HTTP client for notification: {:?}", err);
            return;
        }
    };

    let response = client
        .post(url)
        .json(&serde_json::json!({ "text": message }))
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("error in notification post ({}): {}", status, body);
        }
        Err(err) => {
            error!("error in notification post: {}", err);
        }
    }
}

/// Decide where each message kind goes.
///
/// Successes go to the log webhook and failures to the alert webhook; when
/// only one of the two is configured it receives both kinds, and when
/// neither is configured both destinations are `None`.
fn resolve_webhooks<'a>(
    log_webhook: Option<&'a str>,
    alert_webhook: Option<&'a str>,
) -> (Option<&'a str>, Option<&'a str>) {
    (
        log_webhook.or(alert_webhook),
        alert_webhook.or(log_webhook),
    )
}

/// Post the end-of-invocation notifications.
///
/// Message routing follows `resolve_webhooks`; an empty run list for a
/// message kind skips that post entirely.
pub async fn send_notifications(
    log_webhook: Option<&str>,
    alert_webhook: Option<&str>,
    succeeded_runs: &[String],
    failed_runs: &[String],
) {
    let (log_url, alert_url) = resolve_webhooks(log_webhook, alert_webhook);

    if !succeeded_runs.is_empty() {
        if let Some(url) = log_url {
            post_message(url, &format_message(succeeded_runs, &[])).await;
        } else {
            debug!("no webhook configured, skipping success notification");
        }
    }

    if !failed_runs.is_empty() {
        if let Some(url) = alert_url {
            post_message(url, &format_message(&[], failed_runs)).await;
        } else {
            debug!("no webhook configured, skipping failure notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| (*id).to_owned()).collect()
    }

    #[test]
    fn formats_completed_runs() {
        let message = format_message(&runs(&["run_1", "run_2"]), &[]);
        assert_eq!(
            message,
            ":white_check_mark: S3 Upload: Successfully uploaded 2 runs\
             \n\t:black_square: run_1\n\t:black_square: run_2"
        );
    }

    #[test]
    fn formats_failed_runs() {
        let message = format_message(&[], &runs(&["run_1"]));
        assert_eq!(
            message,
            ":x: S3 Upload: Failed uploading 1 runs\n\t:black_square: run_1"
        );
    }

    #[test]
    fn formats_both_blocks_separated_by_blank_line() {
        let message = format_message(&runs(&["run_1"]), &runs(&["run_2"]));
        assert_eq!(
            message,
            ":white_check_mark: S3 Upload: Successfully uploaded 1 runs\
             \n\t:black_square: run_1\
             \n\n\
             :x: S3 Upload: Failed uploading 1 runs\n\t:black_square: run_2"
        );
    }

    #[test]
    fn empty_inputs_format_to_an_empty_string() {
        assert_eq!(format_message(&[], &[]), "");
    }

    #[test]
    fn both_webhooks_route_each_kind_to_its_own() {
        assert_eq!(
            resolve_webhooks(Some("https://log"), Some("https://alert")),
            (Some("https://log"), Some("https://alert"))
        );
    }

    #[test]
    fn only_log_webhook_receives_both_kinds() {
        assert_eq!(
            resolve_webhooks(Some("https://log"), None),
            (Some("https://log"), Some("https://log"))
        );
    }

    #[test]
    fn only_alert_webhook_receives_both_kinds() {
        assert_eq!(
            resolve_webhooks(None, Some("https://alert")),
            (Some("https://alert"), Some("https://alert"))
        );
    }

    #[test]
    fn no_webhooks_means_nowhere_to_post() {
        assert_eq!(resolve_webhooks(None, None), (None, None));
    }

    #[tokio::test]
    async fn nothing_to_report_posts_nothing() {
        // With both run lists empty no request is made at all, so webhooks
        // pointing at an unroutable port must not slow the call down or
        // produce an error.
        send_notifications(
            Some("http://127.0.0.1:9/log"),
            Some("http://127.0.0.1:9/alert"),
            &[],
            &[],
        )
        .await;
    }
}
