//! Handler adapters
//!
//! A listener is registered with one of three shapes:
//! - [`Handler::envelope`]: receives the whole [`Message`]
//! - [`Handler::text`]: receives the body as a string
//! - [`Handler::typed`]: receives the body decoded into `T`
//!
//! Typed decoding first deserializes the body value directly, then, when the
//! body is a JSON string, parses that string as a JSON document. A body that
//! fits neither way is a [`ConsumeError::TypeMismatch`].

use futures::future::BoxFuture;
use rmq_common::Message;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::ConsumeError;

pub type HandlerResult = anyhow::Result<()>;

type EnvelopeFn = dyn Fn(Message) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type TextFn = dyn Fn(String) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type TypedFn =
    dyn Fn(&Value) -> Result<BoxFuture<'static, HandlerResult>, ConsumeError> + Send + Sync;

#[derive(Clone)]
pub enum Handler {
    Envelope(Arc<EnvelopeFn>),
    Text(Arc<TextFn>),
    Typed(Arc<TypedFn>),
}

impl Handler {
    pub fn envelope<F, Fut>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Envelope(Arc::new(move |message: Message| {
            Box::pin(f(message)) as BoxFuture<'static, HandlerResult>
        }))
    }

    pub fn text<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Text(Arc::new(move |body: String| {
            Box::pin(f(body)) as BoxFuture<'static, HandlerResult>
        }))
    }

    pub fn typed<T, F, Fut>(f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Typed(Arc::new(
            move |body: &Value| -> Result<BoxFuture<'static, HandlerResult>, ConsumeError> {
                let value = decode_body::<T>(body)?;
                Ok(Box::pin(f(value)))
            },
        ))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Envelope(_) => "envelope",
            Handler::Text(_) => "text",
            Handler::Typed(_) => "typed",
        }
    }

    /// Adapt `message` to the handler's parameter and start the call.
    pub(crate) fn invoke(
        &self,
        message: Message,
    ) -> Result<BoxFuture<'static, HandlerResult>, ConsumeError> {
        match self {
            Handler::Envelope(f) => Ok(f(message)),
            Handler::Text(f) => Ok(f(body_text(&message.body))),
            Handler::Typed(f) => f(&message.body),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Strings pass through unquoted; any other body is its JSON text.
pub fn body_text(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn decode_body<T: DeserializeOwned>(body: &Value) -> Result<T, ConsumeError> {
    let direct = match serde_json::from_value::<T>(body.clone()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    if let Value::String(text) = body {
        if let Ok(value) = serde_json::from_str::<T>(text) {
            return Ok(value);
        }
    }
    Err(ConsumeError::TypeMismatch(direct.to_string()))
}
