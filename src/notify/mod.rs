//! Outbound peer notifications.
//!
//! Fire-and-forget GET requests to peer sites. Responses are never parsed and
//! failures are only logged: by the time a notification goes out, the local
//! login or logout has already committed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::sync::identity::{ClientIdentity, CLIENT_IP_HEADER};

/// Grace added to the outbound timeout before a whole batch is cut off.
const BATCH_DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// One outbound GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub url: String,
    /// Identity the tokens in `url` were encrypted for; replayed as headers so
    /// the peer derives the same IV.
    pub identity: ClientIdentity,
}

/// Delivery summary. Non-2xx responses count as failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, requests: Vec<PeerRequest>) -> NotifyReport;
}

/// reqwest-backed notifier with bounded fan-out. Each request and the batch
/// as a whole are held to `timeout`; peers still pending then count as failed.
pub struct HttpNotifier {
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn new(timeout: Duration, max_concurrent: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        })
    }

    async fn send_one(http: reqwest::Client, request: PeerRequest) -> bool {
        let result = http
            .get(&request.url)
            .header(reqwest::header::USER_AGENT, request.identity.user_agent.as_str())
            .header(CLIENT_IP_HEADER, request.identity.ip.as_str())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(peer = %peer_host(&request.url), status = %resp.status(), "Peer notification rejected");
                false
            }
            Err(e) => {
                tracing::warn!(peer = %peer_host(&request.url), "Peer notification failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, requests: Vec<PeerRequest>) -> NotifyReport {
        let mut tasks = JoinSet::new();
        for request in requests {
            let http = self.http.clone();
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                Self::send_one(http, request).await
            });
        }

        let deadline = tokio::time::Instant::now() + self.timeout + BATCH_DEADLINE_SLACK;
        let mut report = NotifyReport::default();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(true))) => report.delivered += 1,
                Ok(Some(Ok(false))) => report.failed += 1,
                Ok(Some(Err(e))) => {
                    tracing::warn!("Peer notification task aborted: {e}");
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    let pending = tasks.len();
                    tracing::warn!(pending, "Peer notification deadline reached");
                    tasks.abort_all();
                    report.failed += pending;
                    break;
                }
            }
        }
        report
    }
}

/// Host part of a notification URL, for logs (never the query string).
fn peer_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> PeerRequest {
        PeerRequest {
            url,
            identity: ClientIdentity::new("Mozilla/5.0 test", "203.0.113.7"),
        }
    }

    #[tokio::test]
    async fn replays_identity_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("ussync-status", "loggingout"))
            .and(header("user-agent", "Mozilla/5.0 test"))
            .and(header("client-ip", "203.0.113.7"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(Duration::from_secs(2), 2).unwrap();
        let report = notifier
            .notify(vec![request(format!("{}/?ussync-status=loggingout", server.uri()))])
            .await;
        assert_eq!(report, NotifyReport { delivered: 1, failed: 0 });
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(Duration::from_secs(2), 4).unwrap();
        let report = notifier
            .notify(vec![
                request(format!("{}/", server.uri())),
                request("http://127.0.0.1:1/".into()),
            ])
            .await;
        assert_eq!(report, NotifyReport { delivered: 0, failed: 2 });
    }

    #[tokio::test]
    async fn hung_peer_is_bounded_by_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(Duration::from_millis(300), 1).unwrap();
        let started = std::time::Instant::now();
        let report = notifier.notify(vec![request(format!("{}/", server.uri()))]).await;
        assert_eq!(report.failed, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn queued_hung_peers_share_one_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(Duration::from_secs(1), 1).unwrap();
        let started = std::time::Instant::now();
        let report = notifier
            .notify((0..4).map(|_| request(format!("{}/", server.uri()))).collect())
            .await;
        assert_eq!(report, NotifyReport { delivered: 0, failed: 4 });
        assert!(started.elapsed() < Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let notifier = HttpNotifier::new(Duration::from_secs(1), 1).unwrap();
        assert_eq!(notifier.notify(Vec::new()).await, NotifyReport::default());
    }

    #[test]
    fn peer_host_hides_query() {
        assert_eq!(peer_host("http://site2.com/?ussync-token=abc"), "site2.com");
        assert_eq!(peer_host("site2.com?x=1"), "site2.com");
    }
}
