//! HTTP and SSE implementations of the transport seams.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{retry, Event, EventSource};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::command::{CommandEndpoint, CommandRequest, CommandResponse};
use crate::error::{SyncError, SyncResult};
use crate::polling::{PollRequest, PollResponse, PollSource};
use crate::subscription::{ChangeEvent, ChangeStream, PushTransport, SubscriptionDescriptor};
use crate::token::SharedToken;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const TOKEN_HEADER: &str = "X-Sync-Token";
const TOKEN_INVALID_CODE: &str = "token_invalid";

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Full-state poll for one battle.
#[derive(Clone)]
pub struct HttpPollSource {
    http: Client,
    base_url: String,
    battle_id: String,
    timeout: Duration,
}

impl HttpPollSource {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        battle_id: impl ToString,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            battle_id: battle_id.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn poll(&self, request: PollRequest) -> SyncResult<PollResponse> {
        let url = join(
            &self.base_url,
            &format!("battles/{}/state", self.battle_id),
        );
        let mut builder = self.http.get(url).timeout(self.timeout);
        if let Some(since) = request.since {
            builder = builder.query(&[("since", since)]);
        }
        let res = builder.send().await?;

        if res.status().is_success() {
            Ok(res.json::<PollResponse>().await?)
        } else {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            Err(SyncError::Status { status, body })
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "message")]
    detail: Option<String>,
}

/// Command endpoint. Every request carries the idempotency token and the
/// shared credential.
#[derive(Clone)]
pub struct HttpCommandEndpoint {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCommandEndpoint {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CommandEndpoint for HttpCommandEndpoint {
    async fn send(
        &self,
        request: &CommandRequest,
        credential: &SharedToken,
    ) -> SyncResult<CommandResponse> {
        let res = self
            .http
            .post(join(&self.base_url, "commands"))
            .timeout(self.timeout)
            .header(IDEMPOTENCY_HEADER, request.idempotency_token.to_string())
            .header(TOKEN_HEADER, &credential.value)
            .json(request)
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            return Ok(res.json::<CommandResponse>().await?);
        }
        let body = res.text().await.unwrap_or_default();
        Err(classify_failure(status, body))
    }
}

fn classify_failure(status: StatusCode, body: String) -> SyncError {
    let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
    let token_invalid = parsed
        .as_ref()
        .and_then(|err| err.code.as_deref())
        .is_some_and(|code| code == TOKEN_INVALID_CODE);

    match status.as_u16() {
        401 | 419 => SyncError::CredentialInvalid(body),
        _ if token_invalid => SyncError::CredentialInvalid(body),
        408 | 429 => SyncError::Status {
            status: status.as_u16(),
            body,
        },
        400..=499 => SyncError::Rejected(
            parsed
                .and_then(|err| err.detail)
                .unwrap_or(body),
        ),
        code => SyncError::Status { status: code, body },
    }
}

/// Push channel over server-sent events. Reconnection belongs to the
/// subscription manager, so the event source's own retry is disabled.
#[derive(Clone)]
pub struct SsePushTransport {
    http: Client,
    realtime_url: Url,
}

impl SsePushTransport {
    pub fn new(http: Client, base_url: &str) -> SyncResult<Self> {
        let realtime_url = Url::parse(&join(base_url, "realtime"))
            .map_err(|err| SyncError::Rejected(format!("invalid realtime url: {err}")))?;
        Ok(Self { http, realtime_url })
    }

    fn url_for(&self, descriptor: &SubscriptionDescriptor) -> Url {
        let mut url = self.realtime_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("topic", descriptor.topic());
            if let Some(filter) = descriptor.filter() {
                query.append_pair("filter", &filter.to_query());
            }
            if !descriptor.kinds().is_empty() {
                let kinds: Vec<&str> = descriptor
                    .kinds()
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect();
                query.append_pair("events", &kinds.join(","));
            }
        }
        url
    }
}

#[async_trait]
impl PushTransport for SsePushTransport {
    async fn connect(&self, descriptor: &SubscriptionDescriptor) -> SyncResult<ChangeStream> {
        let url = self.url_for(descriptor);
        let mut source = EventSource::new(self.http.get(url.clone()))
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        source.set_retry_policy(Box::new(retry::Never));

        // Connected means the server accepted the stream.
        match source.next().await {
            Some(Ok(Event::Open)) => {
                debug!(target = "sync.sse", url = %url, "event stream open");
            }
            Some(Ok(Event::Message(_))) => {}
            Some(Err(err)) => {
                source.close();
                return Err(SyncError::Transport(err.to_string()));
            }
            None => return Err(SyncError::Closed),
        }

        let stream = futures::stream::unfold(source, |mut source| async move {
            loop {
                match source.next().await? {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        match serde_json::from_str::<ChangeEvent>(&message.data) {
                            Ok(event) => return Some((Ok(event), source)),
                            Err(err) => {
                                warn!(
                                    target = "sync.sse",
                                    error = %err,
                                    "skipping undecodable change event"
                                );
                                continue;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        source.close();
                        return None;
                    }
                    Err(err) => {
                        source.close();
                        return Some((Err(SyncError::Transport(err.to_string())), source));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
