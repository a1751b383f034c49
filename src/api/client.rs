use crate::config::ClientConfig;
use crate::state::{run_session, SessionTicket, SessionUpdate, StreamSession};
use crate::types::ChatRequest;
use crate::util::is_local_endpoint_url;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Client side of `POST /chat`: opens the relay stream and drives sessions over it.
#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    chat_url: String,
}

impl ProxyClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self::with_url(config.proxy_url.clone()))
    }

    pub fn with_url(chat_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            chat_url: chat_url.into(),
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    /// Sends the command and returns the response body as raw fragments.
    ///
    /// A non-success status is a transport error; so is a body that ends
    /// without the transport's end-of-stream signal.
    pub async fn create_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let response = self
            .http
            .post(&self.chat_url)
            .json(request)
            .send()
            .await
            .map_err(|error| map_transport_error(error, &self.chat_url))?
            .error_for_status()
            .map_err(|error| map_transport_error(error, &self.chat_url))?;

        let chat_url = self.chat_url.clone();
        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|error| map_transport_error(error, &chat_url)));
        Ok(Box::pin(stream))
    }

    /// Spawns the task that connects and drives the ticket's session.
    ///
    /// Updates flow to `update_tx`; cancelling the ticket's token releases the
    /// connection. The finished session is returned through the join handle.
    pub fn dispatch(
        &self,
        ticket: SessionTicket,
        update_tx: mpsc::UnboundedSender<SessionUpdate>,
    ) -> JoinHandle<StreamSession> {
        let client = self.clone();
        let SessionTicket {
            session,
            cancel,
            history,
        } = ticket;
        let request = ChatRequest::new(session.command().message()).with_history(history);

        tokio::spawn(async move {
            let connect = client.create_stream(&request);
            run_session(session, connect, cancel, Some(&update_tx)).await
        })
    }
}

fn map_transport_error(error: reqwest::Error, url: &str) -> anyhow::Error {
    if error.is_connect() && is_local_endpoint_url(url) {
        return anyhow!(
            "cannot reach local proxy '{}': {}. Start hydro-proxy or update HYDRO_PROXY_URL.",
            url,
            error
        );
    }
    if error.is_connect() {
        return anyhow!("cannot reach proxy '{}': {}", url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!("proxy '{}' returned HTTP {}", url, status);
    }
    if error.is_body() || error.is_decode() {
        return anyhow!("stream from '{}' ended abnormally: {}", url, error);
    }
    anyhow!("request to '{}' failed: {}", url, error)
}
