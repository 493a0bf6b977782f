//! SSE Transport
//!
//! HTTP implementation of [`StreamTransport`]: posts the exchange request to
//! the backend's stream endpoint and splits the response body into raw
//! server-sent events.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{ExchangeRequest, SseDecoder};
use super::traits::{StreamTransport, TransportError, TransportItem};

/// Default stream endpoint path
pub const DEFAULT_STREAM_PATH: &str = "/api/chat/stream";

/// Capacity of the per-exchange event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Streaming exchange over HTTP server-sent events
#[derive(Clone)]
pub struct SseTransport {
    /// Backend base URL, without trailing slash
    base_url: String,
    /// Stream endpoint path
    stream_path: String,
    /// HTTP client (shared with the REST backend so the session cookie is sent)
    http_client: reqwest::Client,
}

impl SseTransport {
    /// Create a transport on top of an existing client
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        stream_path: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stream_path: stream_path.into(),
            http_client,
        }
    }

    /// Get stream endpoint URL
    fn stream_url(&self) -> String {
        format!("{}{}", self.base_url, self.stream_path)
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    fn name(&self) -> &'static str {
        "SSE"
    }

    async fn open(
        &self,
        request: &ExchangeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportItem>, TransportError> {
        let send = self
            .http_client
            .post(self.stream_url())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = send => result.map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();

            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::debug!("SSE stream cancelled, closing connection");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        decoder.push(&bytes);
                        while let Some(event) = decoder.next_event() {
                            if tx.send(TransportItem::Event(event)).await.is_err() {
                                // Receiver dropped, stop streaming
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let failure = TransportError::ReceiveFailed(e.to_string());
                        let _ = tx.send(TransportItem::Failed(failure)).await;
                        return;
                    }
                    None => {
                        if let Some(event) = decoder.finish() {
                            let _ = tx.send(TransportItem::Event(event)).await;
                        }
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::transport::frame::RawEvent;

    /// Accept one connection, consume the request and answer with `response`
    async fn serve_once(response: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        addr
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn test_streams_events_from_http_response() {
        let body = "event: start\ndata: {\"user_message_id\":\"u1\"}\n\n\
                    event: chunk\ndata: {\"content\":\"Hi\"}\n\n\
                    event: end\ndata: {\"content\":\"Hi\"}\n\n";
        let addr = serve_once(http_response("200 OK", body)).await;

        let transport = SseTransport::new(
            reqwest::Client::new(),
            format!("http://{addr}/"),
            DEFAULT_STREAM_PATH,
        );
        let request = ExchangeRequest {
            message: "hello".to_string(),
            ..Default::default()
        };
        let mut rx = transport
            .open(&request, CancellationToken::new())
            .await
            .unwrap();

        let mut names = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                TransportItem::Event(RawEvent { event, .. }) => names.push(event),
                TransportItem::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(names, vec!["start", "chunk", "end"]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let addr = serve_once(http_response("500 Internal Server Error", "boom")).await;

        let transport =
            SseTransport::new(reqwest::Client::new(), format!("http://{addr}"), "/stream");
        let result = transport
            .open(&ExchangeRequest::default(), CancellationToken::new())
            .await;

        assert_eq!(
            result.unwrap_err(),
            TransportError::Status {
                status: 500,
                body: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let transport = SseTransport::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            DEFAULT_STREAM_PATH,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport.open(&ExchangeRequest::default(), cancel).await;
        assert!(matches!(
            result,
            Err(TransportError::Cancelled | TransportError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_stream_url_trims_trailing_slash() {
        let transport = SseTransport::new(
            reqwest::Client::new(),
            "http://localhost:8000/",
            DEFAULT_STREAM_PATH,
        );
        assert_eq!(transport.stream_url(), "http://localhost:8000/api/chat/stream");
    }
}
