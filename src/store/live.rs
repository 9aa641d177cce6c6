//! Live tally store over the realtime database REST interface
//!
//! Transactions use the database's conditional writes: a `GET` with
//! `X-Firebase-ETag: true` returns the value and its ETag, and a `PUT` with
//! `if-match` succeeds only if nobody wrote in between. A `412` answer carries
//! the winner's value and ETag, which seed the next attempt directly.
//! Subscriptions are `text/event-stream` reads of the counter locations. A
//! dropped stream is reopened with a doubling delay; a `cancel` or
//! `auth_revoked` from the server ends the subscription for good.

use super::sse::{EventStreamDecoder, StreamEvent};
use super::{paths, CountCallback, StoreKind, Subscription, TallyStore};
use crate::config::StoreConfig;
use crate::types::{CandidateId, CastResult, DeviceId, Roster, TallyRecord, TallySnapshot};
use crate::{Error, Result, config_error, store_error};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, ETAG, IF_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";

/// Ceiling for the doubling delay between subscription reconnects
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A value read together with its version token
struct Versioned {
    value: Value,
    etag: String,
}

enum Transaction<T> {
    Committed(T),
    /// The update function declined; nothing was written
    Aborted,
}

/// Realtime database client
pub struct LiveTallyStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    max_retries: u32,
    reconnect_delay: Duration,
}

impl LiveTallyStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let base_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| config_error!("Live tally store requires a database URL"))?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| config_error!("Cannot build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
            max_retries: config.max_transaction_retries.max(1),
            reconnect_delay: config.reconnect_delay(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// REST URL of a tree path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        with_auth(builder, &self.auth_token)
    }

    async fn check(path: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(store_error!("{} answered HTTP {}: {}", path, status, body.trim()))
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.request(self.client.get(self.url(path))).send().await?;
        let response = Self::check(path, response).await?;
        let value: Value = response.json().await?;
        decode(path, value)
    }

    async fn read_versioned(&self, path: &str) -> Result<Versioned> {
        let response = self
            .request(self.client.get(self.url(path)))
            .header(ETAG_REQUEST_HEADER, "true")
            .send()
            .await?;
        let response = Self::check(path, response).await?;
        let etag = etag_of(path, &response)?;
        let value = response.json().await?;
        Ok(Versioned { value, etag })
    }

    /// Conditional write; `Ok(Err(winner))` when another writer got there first
    async fn write_if_match(&self, path: &str, body: &Value, etag: &str) -> Result<std::result::Result<(), Versioned>> {
        let response = self
            .request(self.client.put(self.url(path)))
            .header(IF_MATCH, etag)
            .json(body)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            let etag = etag_of(path, &response)?;
            let value = response.json().await?;
            return Ok(Err(Versioned { value, etag }));
        }

        Self::check(path, response).await?;
        Ok(Ok(()))
    }

    /// Optimistic read-modify-write of one location
    ///
    /// `update` sees the current value (default when absent) and returns the
    /// replacement, or `None` to abort without writing.
    async fn transact<T, F>(&self, path: &str, mut update: F) -> Result<Transaction<T>>
    where
        T: DeserializeOwned + Serialize + Default + Send,
        F: FnMut(&T) -> Option<T> + Send,
    {
        let mut current = self.read_versioned(path).await?;

        for attempt in 1..=self.max_retries {
            let value: T = decode(path, current.value.take())?.unwrap_or_default();
            let Some(next) = update(&value) else {
                return Ok(Transaction::Aborted);
            };

            let body = serde_json::to_value(&next)?;
            match self.write_if_match(path, &body, &current.etag).await? {
                Ok(()) => return Ok(Transaction::Committed(next)),
                Err(winner) => {
                    tracing::debug!("Conflict on {} (attempt {}), retrying", path, attempt);
                    current = winner;
                }
            }
        }

        Err(Error::ConflictExhausted {
            key: path.to_string(),
            attempts: self.max_retries,
        })
    }

    async fn stream(&self, path: String, on_change: CountCallback) -> Result<Subscription> {
        let source = EventSource {
            client: self.client.clone(),
            url: self.url(&path),
            auth_token: self.auth_token.clone(),
            path: path.clone(),
        };
        let first = source.open().await?;
        let first_delay = self.reconnect_delay;

        let task = tokio::spawn(async move {
            let mut last = None;
            let mut response = Some(first);
            let mut delay = first_delay;

            loop {
                if let Some(open) = response.take() {
                    delay = first_delay;
                    match source.pump(open, &mut last, &on_change).await {
                        StreamEnd::Dropped => {
                            tracing::warn!("Subscription to {} dropped, reconnecting", source.path);
                        }
                        StreamEnd::Revoked(event) => {
                            tracing::error!(
                                "Subscription to {} ended by server ({}), no further updates",
                                source.path,
                                event
                            );
                            return;
                        }
                    }
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);

                match source.open().await {
                    Ok(open) => {
                        tracing::info!("Subscription to {} re-established", source.path);
                        response = Some(open);
                    }
                    Err(e) => tracing::warn!(
                        "Reconnect to {} failed, next attempt in {:?}: {}",
                        source.path,
                        delay,
                        e
                    ),
                }
            }
        });

        Ok(Subscription::new(path, task))
    }
}

/// How one connection of a subscription ended
enum StreamEnd {
    /// Transport error or the server closed the body; worth reopening
    Dropped,
    /// `cancel` or `auth_revoked`; reopening with the same credentials cannot help
    Revoked(&'static str),
}

/// Everything a subscription task needs to (re)open its event stream
struct EventSource {
    client: Client,
    url: String,
    auth_token: Option<String>,
    path: String,
}

impl EventSource {
    async fn open(&self) -> Result<Response> {
        let request = with_auth(self.client.get(&self.url), &self.auth_token)
            .header(ACCEPT, "text/event-stream");
        let response = request.send().await?;
        LiveTallyStore::check(&self.path, response).await
    }

    /// Deliver counter changes from one connection until it ends
    ///
    /// `last` survives reconnects, so the snapshot `put` a fresh connection
    /// opens with only reaches `on_change` if the value moved meanwhile.
    async fn pump(&self, response: Response, last: &mut Option<u64>, on_change: &CountCallback) -> StreamEnd {
        let mut decoder = EventStreamDecoder::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Subscription to {} lost: {}", self.path, e);
                    return StreamEnd::Dropped;
                }
            };

            for raw in decoder.push(&chunk) {
                let event = match StreamEvent::parse(&raw) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed event on {}: {}", self.path, e);
                        continue;
                    }
                };

                if event.ends_stream() {
                    return StreamEnd::Revoked(event.name());
                }

                match event.counter_value() {
                    Ok(Some(value)) if *last != Some(value) => {
                        *last = Some(value);
                        on_change(value);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Ignoring update on {}: {}", self.path, e),
                }
            }
        }

        StreamEnd::Dropped
    }
}

fn with_auth(builder: RequestBuilder, auth_token: &Option<String>) -> RequestBuilder {
    match auth_token {
        Some(token) => builder.query(&[("auth", token)]),
        None => builder,
    }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| Error::protocol(format!("unexpected value at {}: {}", path, e)))
}

fn etag_of(path: &str, response: &Response) -> Result<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::protocol(format!("no ETag returned for {}", path)))
}

#[async_trait]
impl TallyStore for LiveTallyStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Live
    }

    async fn probe(&self) -> Result<()> {
        self.read::<Value>(paths::TOTAL).await.map(|_| ())
    }

    async fn subscribe_to_candidate(
        &self,
        candidate: &CandidateId,
        on_change: CountCallback,
    ) -> Result<Subscription> {
        self.stream(paths::candidate_count(candidate), on_change).await
    }

    async fn subscribe_to_total(&self, on_change: CountCallback) -> Result<Subscription> {
        self.stream(paths::TOTAL.to_string(), on_change).await
    }

    async fn read_candidate_count(&self, candidate: &CandidateId) -> Result<u64> {
        Ok(self
            .read::<u64>(&paths::candidate_count(candidate))
            .await?
            .unwrap_or(0))
    }

    async fn read_total(&self) -> Result<u64> {
        Ok(self.read::<u64>(paths::TOTAL).await?.unwrap_or(0))
    }

    async fn find_vote(&self, device: &DeviceId, roster: &Roster) -> Result<Option<CandidateId>> {
        let checks = roster.ids().map(|id| async move {
            let marker = self.read::<Value>(&paths::voter(id, device)).await?;
            Ok::<_, Error>(marker.map(|_| id.clone()))
        });

        let found = futures::future::try_join_all(checks).await?;
        Ok(found.into_iter().flatten().next())
    }

    async fn try_cast_vote(&self, candidate: &CandidateId, device: &DeviceId) -> Result<CastResult> {
        let path = paths::candidate(candidate);
        let outcome = self
            .transact::<TallyRecord, _>(&path, |record| record.admit(device.as_str()))
            .await?;

        let count = match outcome {
            Transaction::Aborted => return Ok(CastResult::AlreadyVoted),
            Transaction::Committed(record) => record.count,
        };

        tracing::info!(
            "Vote committed: candidate={}, device={}, count={}",
            candidate,
            device.short(),
            count
        );

        // Separate transaction; the total may lag the per-candidate counts
        if let Err(e) = self.transact::<u64, _>(paths::TOTAL, |total| Some(total + 1)).await {
            tracing::warn!("Vote for {} committed but total not incremented: {}", candidate, e);
        }

        Ok(CastResult::Committed { count })
    }

    async fn snapshot(&self) -> Result<TallySnapshot> {
        let (votes, total) = futures::try_join!(
            self.read::<BTreeMap<String, TallyRecord>>(paths::VOTES),
            self.read::<u64>(paths::TOTAL)
        )?;

        Ok(TallySnapshot {
            votes: votes.unwrap_or_default(),
            total_votes: total.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn config(url: &str, auth: Option<&str>) -> StoreConfig {
        StoreConfig {
            backend: BackendKind::Live,
            database_url: Some(url.to_string()),
            auth_token: auth.map(str::to_string),
            ..StoreConfig::for_testing()
        }
    }

    #[test]
    fn test_url_layout() {
        let store = LiveTallyStore::new(&config("https://example.firebaseio.com/", None)).unwrap();
        assert_eq!(store.base_url(), "https://example.firebaseio.com");
        assert_eq!(
            store.url("votes/pam/count"),
            "https://example.firebaseio.com/votes/pam/count.json"
        );
        assert_eq!(store.url(paths::TOTAL), "https://example.firebaseio.com/totalVotes.json");
    }

    #[test]
    fn test_requires_database_url() {
        let mut cfg = config("https://example.firebaseio.com", None);
        cfg.database_url = None;
        assert!(matches!(LiveTallyStore::new(&cfg), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_auth_token_is_a_query_parameter() {
        let store = LiveTallyStore::new(&config("https://example.firebaseio.com", Some("s3cret"))).unwrap();
        let request = store
            .request(store.client.get(store.url(paths::TOTAL)))
            .build()
            .unwrap();
        assert_eq!(request.url().query(), Some("auth=s3cret"));
    }

    #[test]
    fn test_decode_null_and_mismatch() {
        assert_eq!(decode::<u64>("totalVotes", Value::Null).unwrap(), None);
        assert_eq!(decode::<u64>("totalVotes", serde_json::json!(4)).unwrap(), Some(4));
        assert!(matches!(
            decode::<u64>("totalVotes", serde_json::json!("four")),
            Err(Error::Protocol { .. })
        ));

        let record: TallyRecord = decode("votes/pam", serde_json::json!({"count": 1, "voters": {"d": true}}))
            .unwrap()
            .unwrap();
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transient() {
        let store = LiveTallyStore::new(&config("http://127.0.0.1:9", None)).unwrap();
        let err = store.probe().await.unwrap_err();
        assert!(err.is_transient());

        let err = store
            .try_cast_vote(&CandidateId::new("pam").unwrap(), &DeviceId::new("d1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
