use super::client::ByteStream;
use super::upstream::ApiProtocol;
use crate::proxy::ContentSource;
use crate::types::ChatRequest;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum MockChunk {
    Data(Bytes),
    Fail(String),
}

#[derive(Debug, Clone)]
pub enum MockResponse {
    Stream(Vec<MockChunk>),
    Reject(String),
}

impl MockResponse {
    /// A Gemini stream carrying one envelope per text fragment.
    pub fn gemini_text<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        MockResponse::Stream(
            fragments
                .into_iter()
                .map(|text| MockChunk::Data(gemini_sse_event(text.as_ref())))
                .collect(),
        )
    }
}

/// Scripted upstream: each `open_stream` call consumes the next response.
#[derive(Clone)]
pub struct MockContentSource {
    responses: Arc<Mutex<Vec<MockResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    calls: Arc<AtomicUsize>,
    protocol: ApiProtocol,
}

impl MockContentSource {
    pub fn new(protocol: ApiProtocol, responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            protocol,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| anyhow!("MockContentSource: response queue poisoned"))?;
        if responses.is_empty() {
            return Err(anyhow!("MockContentSource: No more responses configured"));
        }

        match responses.remove(0) {
            MockResponse::Reject(message) => Err(anyhow!(message)),
            MockResponse::Stream(chunks) => {
                let items: Vec<Result<Bytes>> = chunks
                    .into_iter()
                    .map(|chunk| match chunk {
                        MockChunk::Data(bytes) => Ok(bytes),
                        MockChunk::Fail(message) => Err(anyhow!(message)),
                    })
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

impl ContentSource for MockContentSource {
    fn protocol(&self) -> ApiProtocol {
        self.protocol
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn open_stream<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>> {
        let result = self.next_stream(request);
        Box::pin(async move { result })
    }
}

/// Frames `text` as one Gemini `alt=sse` event.
pub fn gemini_sse_event(text: &str) -> Bytes {
    let envelope = json!({
        "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
    });
    Bytes::from(format!("data: {envelope}\r\n\r\n"))
}
