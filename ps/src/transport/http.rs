//! HTTP transport: JSON `PUT` for submission, server-sent events for the channel

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource, retry};
use tracing::{debug, warn};
use url::Url;

use super::{BatchBody, ChannelItem, ChannelStream, RawEvent, StreamHandle, SubmitResponse, Transport};
use crate::error::StreamingError;

/// Transport talking to a real batch endpoint
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport; `request_timeout` bounds connecting and the submission call
    ///
    /// The channel itself is long-lived and is not bounded by the timeout.
    pub fn new(request_timeout: Duration) -> Result<Self, StreamingError> {
        debug!(?request_timeout, "HttpTransport::new: called");
        let client = Client::builder().connect_timeout(request_timeout).build()?;
        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, endpoint: &Url, body: &BatchBody) -> Result<StreamHandle, StreamingError> {
        debug!(%endpoint, requests = body.requests.len(), "HttpTransport::submit: called");
        let response = self
            .client
            .put(endpoint.clone())
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("unknown status").to_string()
            } else {
                text
            };
            warn!(%endpoint, status = status.as_u16(), "HttpTransport::submit: rejected");
            return Err(StreamingError::SubmitStatus {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| StreamingError::InvalidResponse(e.to_string()))?;
        debug!(stream_id = %parsed.id, "HttpTransport::submit: accepted");
        StreamHandle::new(endpoint, parsed.id)
    }

    async fn open_channel(&self, handle: &StreamHandle) -> Result<ChannelStream, StreamingError> {
        debug!(channel_url = %handle.channel_url, "HttpTransport::open_channel: called");
        let mut source = EventSource::new(self.client.get(handle.channel_url.clone()))
            .map_err(|e| StreamingError::Transport(e.to_string()))?;
        // a dropped connection ends the channel instead of reconnecting
        source.set_retry_policy(Box::new(retry::Never));

        let stream = source.filter_map(|item| {
            future::ready(match item {
                Ok(Event::Open) => None,
                Ok(Event::Message(message)) => Some(ChannelItem::Message(RawEvent {
                    name: message.event,
                    data: message.data,
                })),
                Err(reqwest_eventsource::Error::StreamEnded) => None,
                Err(e) => Some(ChannelItem::Error(e.to_string())),
            })
        });
        Ok(stream.boxed())
    }
}
