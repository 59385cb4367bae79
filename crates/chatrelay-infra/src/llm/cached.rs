//! Response cache in front of a model client.
//!
//! Identical requests (same model, messages and sampling parameters) within
//! the TTL are answered from the cache store without contacting the
//! upstream. A cached answer ends with `Finished { cache_hit: true }`, which
//! the pipeline bills as free. A TTL of zero turns the cache off.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};

use chatrelay_core::cache::box_store::BoxCacheStore;
use chatrelay_core::pipeline::collaborators::{GenerationRequest, ModelClient, ModelStream};
use chatrelay_types::llm::{Chunk, ModelEvent, TokenUsage};

pub struct CachedModelClient<M> {
    inner: Arc<M>,
    store: Arc<BoxCacheStore>,
    namespace: String,
    ttl: Duration,
}

impl<M> CachedModelClient<M> {
    pub fn new(
        inner: M,
        store: BoxCacheStore,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(inner),
            store: Arc::new(store),
            namespace: namespace.into(),
            ttl,
        }
    }

    fn key(&self, request: &GenerationRequest) -> Option<String> {
        if self.ttl.is_zero() {
            return None;
        }
        let identity = (&request.model, &request.messages, &request.params);
        match serde_json::to_vec(&identity) {
            Ok(bytes) => Some(format!("{}:{:x}", self.namespace, Sha256::digest(&bytes))),
            Err(e) => {
                tracing::warn!(error = %e, "request not cacheable");
                None
            }
        }
    }
}

async fn lookup(store: &BoxCacheStore, key: &str) -> Option<Chunk> {
    match store.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                tracing::warn!(key, error = %e, "undecodable cached response");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(key, error = %e, "response cache lookup failed");
            None
        }
    }
}

async fn remember(store: &BoxCacheStore, key: &str, answer: &Chunk, ttl: Duration) {
    let raw = match serde_json::to_string(answer) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to encode response for cache");
            return;
        }
    };
    if let Err(e) = store.set(key, &raw, ttl).await {
        tracing::warn!(key, error = %e, "failed to store cached response");
    }
}

impl<M: ModelClient + 'static> ModelClient for CachedModelClient<M> {
    fn stream_chat(&self, request: GenerationRequest) -> ModelStream {
        let Some(key) = self.key(&request) else {
            return self.inner.stream_chat(request);
        };
        let inner = self.inner.clone();
        let store = self.store.clone();
        let ttl = self.ttl;

        Box::pin(try_stream! {
            if let Some(cached) = lookup(&store, &key).await {
                tracing::debug!(key = %key, "response cache hit");
                yield ModelEvent::Chunk(cached);
                yield ModelEvent::Finished { cache_hit: true, usage: TokenUsage::default() };
            } else {
                let mut upstream = inner.stream_chat(request);
                let mut answer = Chunk::default();

                while let Some(event) = upstream.next().await {
                    match event? {
                        ModelEvent::Chunk(chunk) => {
                            answer.content.push_str(&chunk.content);
                            if let Some(reasoning) = &chunk.reasoning {
                                answer.reasoning.get_or_insert_with(String::new).push_str(reasoning);
                            }
                            yield ModelEvent::Chunk(chunk);
                        }
                        ModelEvent::Finished { cache_hit, usage } => {
                            if !answer.content.is_empty() {
                                remember(&store, &key, &answer, ttl).await;
                            }
                            yield ModelEvent::Finished { cache_hit, usage };
                        }
                    }
                }
            }
        })
    }
}
