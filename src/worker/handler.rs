//! # Task Handlers
//!
//! The contract business logic implements for one queue: take the stage
//! input, return the stage output or a classified error. Transient errors
//! are retried by the dispatcher; permanent ones end the task at once.

use crate::models::TaskFailure;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("Transient handler error: {0}")]
    Transient(String),

    #[error("Permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn into_failure(self) -> TaskFailure {
        match self {
            Self::Transient(message) => TaskFailure::transient(message),
            Self::Permanent(message) => TaskFailure::permanent(message),
        }
    }
}

/// Input that does not decode is never going to succeed on retry
impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {error}"))
    }
}

/// Handler for every invocation arriving on one queue
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, input: Value) -> Result<Value, HandlerError>;

    /// Name used in logs
    fn handler_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

pub type SharedHandler = Arc<dyn TaskHandler>;

/// Wrap an async closure over raw JSON
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, input: Value) -> Result<Value, HandlerError> {
        (self.0)(input).await
    }
}

/// Wrap an async closure over typed payloads; decoding and encoding happen
/// around it.
pub fn typed_handler<I, O, F, Fut>(f: F) -> TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

pub struct TypedHandler<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, F, Fut> TaskHandler for TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
{
    async fn handle(&self, input: Value) -> Result<Value, HandlerError> {
        let input: I = serde_json::from_value(input)?;
        let output = (self.f)(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}
