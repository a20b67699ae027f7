//! HTTP delivery of event batches, with bounded retry.
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::{Error, Result};

const MAX_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Delivery seam between the flush workers and the control plane.
pub trait EventSender: Send + Sync {
    /// POST one JSON body. Implementations retry per their own policy and
    /// report only the final outcome.
    fn post_json(&self, uri: &str, payload: &[u8]) -> Result<()>;

    /// Release any resources. Must be idempotent.
    fn close(&self) {}
}

/// The default sender: a pooled HTTP client with capped exponential
/// retry sleeps. Non-2xx responses are retryable; the response body is
/// drained on every attempt so connections can be reused.
pub struct InsightSender {
    client: reqwest::blocking::Client,
    headers: HeaderMap,
    retry_interval: Duration,
    max_retry_times: u32,
}

impl InsightSender {
    pub fn new(
        client: reqwest::blocking::Client,
        headers: HeaderMap,
        retry_interval: Duration,
        max_retry_times: u32,
    ) -> InsightSender {
        InsightSender {
            client,
            headers,
            retry_interval,
            max_retry_times,
        }
    }
}

impl EventSender for InsightSender {
    fn post_json(&self, uri: &str, payload: &[u8]) -> Result<()> {
        if uri.is_empty() || payload.is_empty() {
            return Err(Error::SendFailed);
        }

        let mut last_error = Error::SendFailed;
        for attempt in 0..=self.max_retry_times {
            if attempt > 0 {
                let sleep = self
                    .retry_interval
                    .saturating_mul(1 << attempt)
                    .min(MAX_RETRY_SLEEP);
                std::thread::sleep(sleep);
            }

            let response = self
                .client
                .post(uri)
                .headers(self.headers.clone())
                .body(payload.to_vec())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    // Drain and drop the body regardless of the status.
                    let _ = response.bytes();
                    if status.is_success() {
                        log::debug!(target: "flagstream", "sending events ok");
                        return Ok(());
                    }
                    log::warn!(target: "flagstream",
                        "events sending got status {status}, attempt {attempt}");
                }
                Err(err) => {
                    log::warn!(target: "flagstream", "events sending error: {err}");
                    last_error = Error::from(err);
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    /// Minimal HTTP endpoint: answers every request with the given status
    /// and counts the requests it saw.
    fn serve(status_line: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(
                    format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .as_bytes(),
                );
            }
        });
        format!("http://{addr}/api/public/insight/track")
    }

    fn sender(retries: u32) -> InsightSender {
        InsightSender::new(
            reqwest::blocking::Client::new(),
            HeaderMap::new(),
            Duration::from_millis(1),
            retries,
        )
    }

    #[test]
    fn success_on_2xx() {
        let hits = Arc::new(AtomicUsize::new(0));
        let uri = serve("HTTP/1.1 200 OK", hits.clone());
        assert!(sender(1).post_json(&uri, b"[]").is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_2xx_is_retried_until_exhausted() {
        let hits = Arc::new(AtomicUsize::new(0));
        let uri = serve("HTTP/1.1 503 Service Unavailable", hits.clone());
        assert!(sender(2).post_json(&uri, b"[]").is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(sender(0).post_json("", b"x").is_err());
        assert!(sender(0).post_json("http://localhost", b"").is_err());
    }
}
