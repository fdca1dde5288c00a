//! A scripted HTTP server for exercising the provider clients.
use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    Router,
};
use tokio::{
    net::TcpListener,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

/// A request as the server received it.
#[derive(Debug)]
pub(crate) struct Captured {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

struct Reply {
    status: StatusCode,
    body: &'static str,
    delay: Duration,
    requests: UnboundedSender<Captured>,
}

/// Answers every request with the same status and body, recording what it received.
pub(crate) struct TestServer {
    pub url: String,
    requests: UnboundedReceiver<Captured>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(status: StatusCode, body: &'static str) -> Self {
        Self::start_after(Duration::ZERO, status, body).await
    }

    /// Waits `delay` before answering.
    pub async fn start_after(delay: Duration, status: StatusCode, body: &'static str) -> Self {
        let (sender, requests) = unbounded_channel();
        let reply = Arc::new(Reply {
            status,
            body,
            delay,
            requests: sender,
        });
        let app = Router::new().fallback(respond).with_state(reply);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url,
            requests,
            handle,
        }
    }

    /// The next request the server received.
    pub async fn request(&mut self) -> Captured {
        self.requests.recv().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(
    State(reply): State<Arc<Reply>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], &'static str) {
    reply
        .requests
        .send(Captured {
            method,
            path: uri.path().to_owned(),
            headers,
            body,
        })
        .unwrap();
    tokio::time::sleep(reply.delay).await;
    (
        reply.status,
        [(header::CONTENT_TYPE, "application/json")],
        reply.body,
    )
}
