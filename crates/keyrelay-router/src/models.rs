//! `GET /v1/models`: synthesises a listing from every provider's claimed
//! capability set rather than proxying a real upstream endpoint, since no
//! single upstream speaks for the whole pool. Cached for 60s (§6) so a
//! chatty client doesn't force a full pool walk on every call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keyrelay_protocol::openai::models::{ModelListResponse, ModelObject};
use keyrelay_provider_core::KeyPool;
use tokio::sync::Mutex;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct Cached {
    body: bytes::Bytes,
    fetched_at: Instant,
}

/// Holds the last synthesized listing behind a mutex; cheap enough that a
/// stampede of concurrent misses just means a few redundant pool walks.
pub struct ModelListCache {
    inner: Mutex<Option<Cached>>,
}

impl ModelListCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    pub async fn get(&self, pool: &Arc<KeyPool>) -> bytes::Bytes {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return cached.body.clone();
            }
        }
        let body = build(pool).await;
        *guard = Some(Cached { body: body.clone(), fetched_at: Instant::now() });
        body
    }
}

async fn build(pool: &Arc<KeyPool>) -> bytes::Bytes {
    let mut ids: Vec<(String, String)> = Vec::new();
    for view in pool.list().await {
        if view.is_disabled || view.is_revoked {
            continue;
        }
        for family in view.model_families {
            if !ids.iter().any(|(id, _)| id == &family) {
                ids.push((family, view.service.clone()));
            }
        }
    }
    ids.sort();
    let models = ids
        .into_iter()
        .map(|(id, owned_by)| ModelObject { id, object: "model".to_string(), created: 0, owned_by })
        .collect();
    let response = ModelListResponse::new(models);
    bytes::Bytes::from(serde_json::to_vec(&response).unwrap_or_default())
}
