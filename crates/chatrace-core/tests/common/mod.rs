//! Scripted providers for driving races without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use chatrace_core::error::ProviderError;
use chatrace_core::provider::{ProviderDescriptor, StreamOpener};
use chatrace_core::sse::ByteStream;
use chatrace_core::types::{ConversationPayload, Message};

pub const HEARTBEAT: &str = ": keep-alive\n\n";
pub const ROLE_ONLY: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";

pub fn content(text: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
}

/// What a scripted provider does when opened.
#[derive(Clone)]
pub enum Script {
    /// Refuse with this HTTP status.
    Reject(u16),
    /// Take `delay` to connect, then send nothing until cancelled.
    Hang(Duration),
    /// Connect at once and send each chunk after its delay. The body ends
    /// after the last chunk.
    Chunks(Vec<(Duration, String)>),
    /// Like `Chunks`, then the connection drops.
    Broken(Vec<(Duration, String)>),
    /// One script per attempt; the last one repeats.
    Sequence(Vec<Script>),
}

pub struct ScriptedOpener {
    scripts: HashMap<String, Script>,
    tokens: Mutex<HashMap<String, Vec<CancellationToken>>>,
    opens: Mutex<Vec<String>>,
    reads: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl ScriptedOpener {
    pub fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(id, s)| (id.to_string(), s))
                .collect(),
            tokens: Mutex::new(HashMap::new()),
            opens: Mutex::new(Vec::new()),
            reads: Mutex::new(HashMap::new()),
        }
    }

    /// Tokens handed to every open of `provider`, in order.
    pub fn tokens(&self, provider: &str) -> Vec<CancellationToken> {
        self.tokens
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the latest attempt of `provider` was cancelled.
    pub fn cancelled(&self, provider: &str) -> bool {
        self.tokens(provider).last().is_some_and(|t| t.is_cancelled())
    }

    pub fn opens(&self) -> Vec<String> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self, provider: &str) -> usize {
        self.opens().iter().filter(|p| *p == provider).count()
    }

    /// Chunks delivered by `provider` across all attempts.
    pub fn reads(&self, provider: &str) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(provider)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn counter(&self, provider: &str) -> Arc<AtomicUsize> {
        self.reads
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StreamOpener for ScriptedOpener {
    async fn open(
        &self,
        provider: &ProviderDescriptor,
        _payload: &ConversationPayload,
        cancel: CancellationToken,
    ) -> Result<ByteStream, ProviderError> {
        let attempt = self.open_count(&provider.id);
        self.opens.lock().unwrap().push(provider.id.clone());
        self.tokens
            .lock()
            .unwrap()
            .entry(provider.id.clone())
            .or_default()
            .push(cancel.clone());

        let script = match self.scripts.get(&provider.id).cloned() {
            Some(Script::Sequence(steps)) => steps
                .get(attempt)
                .or(steps.last())
                .cloned()
                .unwrap_or(Script::Reject(404)),
            Some(script) => script,
            None => Script::Reject(404),
        };
        let reads = self.counter(&provider.id);

        match script {
            Script::Reject(status) => Err(ProviderError::UpstreamRejected {
                status,
                message: "scripted failure".to_string(),
            }),
            Script::Hang(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(Box::pin(async_stream::stream! {
                    cancel.cancelled().await;
                    if false {
                        yield Ok::<Bytes, ProviderError>(Bytes::new());
                    }
                }))
            }
            Script::Chunks(chunks) => Ok(scripted_body(chunks, false, cancel, reads)),
            Script::Broken(chunks) => Ok(scripted_body(chunks, true, cancel, reads)),
            Script::Sequence(_) => unreachable!("nested sequences are not supported"),
        }
    }
}

fn scripted_body(
    chunks: Vec<(Duration, String)>,
    break_at_end: bool,
    cancel: CancellationToken,
    reads: Arc<AtomicUsize>,
) -> ByteStream {
    Box::pin(async_stream::stream! {
        for (delay, chunk) in chunks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            reads.fetch_add(1, Ordering::SeqCst);
            yield Ok::<Bytes, ProviderError>(Bytes::from(chunk));
        }
        if break_at_end && !cancel.is_cancelled() {
            yield Err(ProviderError::UpstreamStream("connection reset".to_string()));
        }
    })
}

pub fn provider(id: &str) -> ProviderDescriptor {
    ProviderDescriptor::new(id, id.to_uppercase(), "https://example.invalid/v1", "key", "model")
}

pub fn providers(ids: &[&str]) -> Vec<ProviderDescriptor> {
    ids.iter().map(|id| provider(id)).collect()
}

pub fn payload() -> Arc<ConversationPayload> {
    Arc::new(ConversationPayload::new("system", vec![Message::user("hello")]))
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}
