use crate::config::ActuatorConfig;
use crate::error::ActuatorError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DIALOGUE_QUEUE_CAP: usize = 50;

/// One embodied entity as reported by the actuator service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub anchor: Option<Anchor>,
    #[serde(default)]
    pub active_behavior: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

/// Dialogue queued for the presentation collaborator to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub author: String,
    pub text: String,
    pub duration_secs: u64,
}

#[derive(Deserialize)]
struct EntitiesPayload {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[derive(Serialize)]
struct BehaviorPayload<'a> {
    behavior: &'a str,
    id: i64,
}

#[derive(Serialize)]
struct SpawnPayload<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchor: Option<Anchor>,
}

struct ClientState {
    entities: Vec<Entity>,
    cached_at: Option<Instant>,
    active_entity: Option<i64>,
    consecutive_failures: u32,
    current_backoff: Duration,
    backoff_until: Option<Instant>,
    dialogue: VecDeque<DialogueLine>,
}

/// Resilient client for the embodiment HTTP API.
///
/// Entity discovery is cached with a short TTL and invalidated after any
/// successful mutating call. Transport failures grow an exponential backoff
/// with jitter; calls made before the backoff expires fail fast without
/// touching the network. A stale entity reference (404) triggers one
/// re-discovery and one retry before the failure is reported.
pub struct ActuatorClient {
    http: reqwest::Client,
    base_url: String,
    cache_ttl: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    state: Mutex<ClientState>,
}

impl ActuatorClient {
    pub fn new(config: &ActuatorConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let backoff_initial = Duration::from_millis(config.backoff_initial_ms);
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cache_ttl: Duration::from_millis(config.entity_cache_ttl_ms),
            backoff_initial,
            backoff_max: Duration::from_millis(config.backoff_max_ms).max(backoff_initial),
            state: Mutex::new(ClientState {
                entities: Vec::new(),
                cached_at: None,
                active_entity: None,
                consecutive_failures: 0,
                current_backoff: backoff_initial,
                backoff_until: None,
                dialogue: VecDeque::new(),
            }),
        })
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// List entities, serving the cache while it is fresh.
    pub async fn discover(&self) -> Result<Vec<Entity>, ActuatorError> {
        {
            let state = self.state.lock().await;
            if let Some(cached_at) = state.cached_at
                && cached_at.elapsed() < self.cache_ttl
            {
                return Ok(state.entities.clone());
            }
        }
        self.discover_fresh().await
    }

    /// Bypass the cache and hit the service.
    pub async fn discover_fresh(&self) -> Result<Vec<Entity>, ActuatorError> {
        let response = self.request_get("/entities").await?;
        let payload: EntitiesPayload = response
            .json()
            .await
            .map_err(|e| ActuatorError::Transport(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.active_entity = payload.entities.first().map(|e| e.id);
        state.entities = payload.entities.clone();
        state.cached_at = Some(Instant::now());
        Ok(payload.entities)
    }

    /// Anchor of the primary entity, if one is known.
    pub async fn primary_anchor(&self) -> Option<(f64, f64)> {
        let entities = self.discover().await.ok()?;
        let anchor = entities.first()?.anchor?;
        Some((anchor.x, anchor.y))
    }

    /// Active behavior of the primary entity, if one is known.
    pub async fn active_behavior(&self) -> Option<String> {
        let entities = self.discover().await.ok()?;
        entities.first()?.active_behavior.clone()
    }

    // ── Behavior control ────────────────────────────────────────────────

    /// Trigger a behavior on the primary entity. On a stale id the cache is
    /// rebuilt and the call retried exactly once.
    pub async fn invoke(&self, behavior: &str) -> Result<i64, ActuatorError> {
        let entity_id = self.primary_entity_id().await?;

        match self.put_behavior(entity_id, behavior).await {
            Ok(()) => {
                self.invalidate_cache().await;
                tracing::info!(behavior, entity_id, "behavior triggered");
                Ok(entity_id)
            }
            Err(ActuatorError::StaleEntity(stale)) => {
                tracing::warn!(stale, "entity id not recognised; re-discovering");
                self.invalidate_cache().await;
                let fresh = self.discover_fresh().await?;
                let new_id = fresh
                    .first()
                    .map(|e| e.id)
                    .ok_or(ActuatorError::NoEntities)?;
                self.put_behavior(new_id, behavior).await?;
                self.invalidate_cache().await;
                tracing::info!(behavior, entity_id = new_id, "behavior triggered after re-discovery");
                Ok(new_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a new companion entity.
    pub async fn spawn(&self, name: &str, anchor: Option<Anchor>) -> Result<Entity, ActuatorError> {
        let url = format!("{}/entities", self.base_url);
        self.check_backoff().await?;
        let result = self.http.post(&url).json(&SpawnPayload { name, anchor }).send().await;
        let response = self.settle(result).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.record_status_failure(status.as_u16(), body).await);
        }

        let entity: Entity = response
            .json()
            .await
            .map_err(|e| ActuatorError::Transport(e.to_string()))?;
        self.invalidate_cache().await;
        Ok(entity)
    }

    // ── Dialogue queue ──────────────────────────────────────────────────

    pub async fn queue_dialogue(&self, author: &str, text: &str, duration_secs: u64) {
        let mut state = self.state.lock().await;
        if state.dialogue.len() == DIALOGUE_QUEUE_CAP {
            state.dialogue.pop_front();
        }
        state.dialogue.push_back(DialogueLine {
            author: author.to_string(),
            text: text.to_string(),
            duration_secs,
        });
    }

    pub async fn drain_dialogue(&self) -> Vec<DialogueLine> {
        let mut state = self.state.lock().await;
        state.dialogue.drain(..).collect()
    }

    // ── Backoff introspection ───────────────────────────────────────────

    pub async fn backoff_remaining(&self) -> Duration {
        let state = self.state.lock().await;
        state
            .backoff_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()))
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    pub async fn current_backoff(&self) -> Duration {
        self.state.lock().await.current_backoff
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn primary_entity_id(&self) -> Result<i64, ActuatorError> {
        {
            let state = self.state.lock().await;
            if let Some(id) = state.active_entity {
                return Ok(id);
            }
        }
        let entities = self.discover_fresh().await?;
        entities.first().map(|e| e.id).ok_or(ActuatorError::NoEntities)
    }

    async fn put_behavior(&self, entity_id: i64, behavior: &str) -> Result<(), ActuatorError> {
        let url = format!("{}/entities/{entity_id}", self.base_url);
        self.check_backoff().await?;
        let result = self
            .http
            .put(&url)
            .json(&BehaviorPayload {
                behavior,
                id: entity_id,
            })
            .send()
            .await;
        let response = self.settle(result).await?;

        let status = response.status();
        if status.as_u16() == 404 {
            // Stale reference, not a transport fault: no backoff.
            return Err(ActuatorError::StaleEntity(entity_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.record_status_failure(status.as_u16(), body).await);
        }
        self.record_success().await;
        Ok(())
    }

    async fn request_get(&self, path: &str) -> Result<reqwest::Response, ActuatorError> {
        let url = format!("{}{path}", self.base_url);
        self.check_backoff().await?;
        let result = self.http.get(&url).send().await;
        let response = self.settle(result).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.record_status_failure(status.as_u16(), body).await);
        }
        self.record_success().await;
        Ok(response)
    }

    async fn check_backoff(&self) -> Result<(), ActuatorError> {
        let state = self.state.lock().await;
        if let Some(until) = state.backoff_until {
            let remaining = until.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                return Err(ActuatorError::BackoffActive {
                    remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }

    /// Transport-level settle: a send error grows the backoff.
    async fn settle(
        &self,
        result: reqwest::Result<reqwest::Response>,
    ) -> Result<reqwest::Response, ActuatorError> {
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.record_transport_failure().await;
                Err(ActuatorError::Transport(e.to_string()))
            }
        }
    }

    async fn record_transport_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        let jitter_cap = state.current_backoff.mul_f64(0.1);
        let jitter = rand::rng().random_range(Duration::ZERO..=jitter_cap.max(Duration::from_millis(1)));
        state.backoff_until = Some(Instant::now() + state.current_backoff + jitter);
        state.current_backoff = (state.current_backoff * 2).min(self.backoff_max);
        tracing::warn!(
            failures = state.consecutive_failures,
            backoff_ms = state.current_backoff.as_millis() as u64,
            "actuator unreachable; backing off"
        );
    }

    async fn record_status_failure(&self, status: u16, body: String) -> ActuatorError {
        self.record_transport_failure().await;
        ActuatorError::Status { status, body }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_failures > 0 {
            tracing::info!("reconnected to actuator service");
        }
        state.consecutive_failures = 0;
        state.current_backoff = self.backoff_initial;
        state.backoff_until = None;
    }

    async fn invalidate_cache(&self) {
        let mut state = self.state.lock().await;
        state.entities.clear();
        state.cached_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(base_url: &str) -> ActuatorConfig {
        ActuatorConfig {
            base_url: base_url.to_string(),
            request_timeout_ms: 1000,
            entity_cache_ttl_ms: 10_000,
            backoff_initial_ms: 20,
            backoff_max_ms: 100,
        }
    }

    fn entities_body(ids: &[i64]) -> serde_json::Value {
        serde_json::json!({
            "entities": ids
                .iter()
                .map(|id| serde_json::json!({
                    "id": id,
                    "name": "companion",
                    "anchor": {"x": 120.0, "y": 480.0},
                    "active_behavior": "Sit"
                }))
                .collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn discover_serves_cache_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entities_body(&[7])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ActuatorClient::new(&fast_config(&server.uri())).unwrap();
        let first = client.discover().await.unwrap();
        let second = client.discover().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].id, 7);
    }

    #[tokio::test]
    async fn invoke_puts_behavior_and_invalidates_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entities_body(&[3])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/entities/3"))
            .and(body_partial_json(serde_json::json!({"behavior": "Walk", "id": 3})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ActuatorClient::new(&fast_config(&server.uri())).unwrap();
        let id = client.invoke("Walk").await.unwrap();
        assert_eq!(id, 3);
        // Cache was invalidated by the mutating call.
        assert!(client.state.lock().await.cached_at.is_none());
    }

    #[tokio::test]
    async fn stale_entity_rediscovers_and_retries_once() {
        let server = MockServer::start().await;
        // First discovery returns id 3; the PUT 404s; re-discovery returns 9.
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entities_body(&[3])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/entities/3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entities_body(&[9])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/entities/9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ActuatorClient::new(&fast_config(&server.uri())).unwrap();
        let id = client.invoke("Jump").await.unwrap();
        assert_eq!(id, 9);
        // A stale reference is not a transport fault.
        assert_eq!(client.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn backoff_doubles_per_failure_and_resets_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entities_body(&[1])))
            .mount(&server)
            .await;

        let config = fast_config(&server.uri());
        let client = ActuatorClient::new(&config).unwrap();

        // k = 1: current_backoff = initial * 2
        assert!(client.discover_fresh().await.is_err());
        assert_eq!(client.consecutive_failures().await, 1);
        assert_eq!(client.current_backoff().await, Duration::from_millis(40));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // k = 2: current_backoff = initial * 4
        assert!(client.discover_fresh().await.is_err());
        assert_eq!(client.consecutive_failures().await, 2);
        assert_eq!(client.current_backoff().await, Duration::from_millis(80));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // First success resets to initial and clears backoff_until.
        client.discover_fresh().await.unwrap();
        assert_eq!(client.consecutive_failures().await, 0);
        assert_eq!(client.current_backoff().await, Duration::from_millis(20));
        assert_eq!(client.backoff_remaining().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn backoff_caps_at_max() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ActuatorClient::new(&fast_config(&server.uri())).unwrap();
        for _ in 0..6 {
            let _ = client.discover_fresh().await;
            tokio::time::sleep(client.backoff_remaining().await).await;
        }
        assert_eq!(client.current_backoff().await, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn calls_fail_fast_while_backoff_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entities"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = ActuatorConfig {
            backoff_initial_ms: 60_000,
            ..fast_config(&server.uri())
        };
        let client = ActuatorClient::new(&config).unwrap();

        assert!(client.discover_fresh().await.is_err());
        // Second call must not reach the network (expect(1) above).
        let err = client.discover_fresh().await.unwrap_err();
        assert!(matches!(err, ActuatorError::BackoffActive { .. }));
    }

    #[tokio::test]
    async fn dialogue_queue_bounded_and_drains() {
        let server = MockServer::start().await;
        let client = ActuatorClient::new(&fast_config(&server.uri())).unwrap();

        for i in 0..(DIALOGUE_QUEUE_CAP + 5) {
            client.queue_dialogue("companion", &format!("line {i}"), 6).await;
        }
        let drained = client.drain_dialogue().await;
        assert_eq!(drained.len(), DIALOGUE_QUEUE_CAP);
        assert_eq!(drained[0].text, "line 5");
        assert!(client.drain_dialogue().await.is_empty());
    }
}
