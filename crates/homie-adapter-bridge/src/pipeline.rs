//! Parser/transformer pipeline
//!
//! Every flow runs the same two stages: the raw payload is decoded by the
//! flow's parser, then handed to its transformer. Both stages default to
//! identity (`PLAIN` parser, [`Identity`] transformer).
//!
//! Parsers are looked up in a [`ParserTable`] owned by the [`Pipeline`], so
//! tests and embedders can register their own decoders without touching
//! global state.

use async_trait::async_trait;
use futures::future::BoxFuture;
use homie_adapter_core::{render_value, FlowDeclaration, NodeState, ParserKind, TransformerSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

use crate::error::{BridgeError, Result};

/// Value transformation applied after parsing
///
/// Implementations may suspend. The default implementation passes the
/// value through unchanged.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Transform a parsed value
    async fn transform(&self, value: Value) -> Result<Value> {
        Ok(value)
    }
}

/// Identity transformer
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

#[async_trait]
impl Transformer for Identity {}

#[async_trait]
impl Transformer for TransformerSpec {
    async fn transform(&self, value: Value) -> Result<Value> {
        Ok(self.apply(value))
    }
}

/// Transformer backed by a synchronous closure
pub struct FnTransformer<F> {
    f: F,
}

#[async_trait]
impl<F> Transformer for FnTransformer<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    async fn transform(&self, value: Value) -> Result<Value> {
        (self.f)(value)
    }
}

/// Wrap a closure as a transformer
pub fn from_fn<F>(f: F) -> FnTransformer<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    FnTransformer { f }
}

type AsyncTransformFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Transformer backed by an async closure
pub struct AsyncFnTransformer {
    f: Box<AsyncTransformFn>,
}

#[async_trait]
impl Transformer for AsyncFnTransformer {
    async fn transform(&self, value: Value) -> Result<Value> {
        (self.f)(value).await
    }
}

/// Wrap an async closure as a transformer
pub fn from_async_fn<F, Fut>(f: F) -> AsyncFnTransformer
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    AsyncFnTransformer {
        f: Box::new(move |value| Box::pin(f(value))),
    }
}

/// Decoder from raw payload bytes to a value
pub trait PayloadParser: Send + Sync {
    /// Decode a payload received on (or destined for) `topic`
    fn parse(&self, topic: &str, payload: &[u8]) -> Result<Value>;
}

/// Payload text used unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainParser;

impl PayloadParser for PlainParser {
    fn parse(&self, _topic: &str, payload: &[u8]) -> Result<Value> {
        Ok(Value::String(String::from_utf8_lossy(payload).into_owned()))
    }
}

/// Payload decoded as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl PayloadParser for JsonParser {
    fn parse(&self, topic: &str, payload: &[u8]) -> Result<Value> {
        serde_json::from_slice(payload).map_err(|e| BridgeError::Decode {
            topic: topic.to_string(),
            parser: ParserKind::Json,
            reason: e.to_string(),
        })
    }
}

/// Parsers keyed by kind
#[derive(Clone)]
pub struct ParserTable {
    parsers: HashMap<ParserKind, Arc<dyn PayloadParser>>,
}

impl ParserTable {
    /// Table without any parser
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Register (or replace) the parser for a kind
    pub fn register(&mut self, kind: ParserKind, parser: impl PayloadParser + 'static) {
        self.parsers.insert(kind, Arc::new(parser));
    }

    /// Look up a parser
    pub fn get(&self, kind: ParserKind) -> Option<&Arc<dyn PayloadParser>> {
        self.parsers.get(&kind)
    }
}

impl Default for ParserTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(ParserKind::Plain, PlainParser);
        table.register(ParserKind::Json, JsonParser);
        table
    }
}

impl fmt::Debug for ParserTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserTable")
            .field("kinds", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One direction of a transform rule
#[derive(Clone)]
pub struct Flow {
    /// Device topic
    pub topic: String,
    /// Parser applied to the payload
    pub parser: ParserKind,
    /// Transformer applied to the parsed value
    pub transformer: Arc<dyn Transformer>,
}

impl Flow {
    /// Flow with the default parser and identity transformer
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            parser: ParserKind::default(),
            transformer: Arc::new(Identity),
        }
    }

    /// Set the parser
    pub fn with_parser(mut self, parser: ParserKind) -> Self {
        self.parser = parser;
        self
    }

    /// Set the transformer
    pub fn with_transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }

    /// Set an already shared transformer
    pub fn with_shared_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Compile a declared flow
    pub fn from_declaration(declaration: &FlowDeclaration) -> Self {
        let flow = Self::new(declaration.topic.clone())
            .with_parser(declaration.parser.unwrap_or_default());
        match &declaration.transformer {
            Some(spec) => flow.with_transformer(spec.clone()),
            None => flow,
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("topic", &self.topic)
            .field("parser", &self.parser)
            .finish_non_exhaustive()
    }
}

/// Runs flows against payloads
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    parsers: Arc<ParserTable>,
}

impl Pipeline {
    /// Create a pipeline over a parser table
    pub fn new(parsers: ParserTable) -> Self {
        Self {
            parsers: Arc::new(parsers),
        }
    }

    /// Parse then transform a payload
    pub async fn run(&self, flow: &Flow, payload: &[u8]) -> Result<Value> {
        let parser = self
            .parsers
            .get(flow.parser)
            .ok_or(BridgeError::ParserNotRegistered(flow.parser))?;
        let parsed = parser.parse(&flow.topic, payload)?;
        trace!(topic = %flow.topic, parser = %flow.parser, "payload parsed");
        flow.transformer.transform(parsed).await
    }

    /// Run a flow and render its output as payload bytes
    pub async fn run_to_payload(&self, flow: &Flow, payload: &[u8]) -> Result<String> {
        let value = self.run(flow, payload).await?;
        Ok(render_value(&value))
    }
}

/// Map a transformed value onto an allowed node state
pub fn coerce_node_state(value: &Value) -> NodeState {
    NodeState::coerce(&render_value(value))
}
