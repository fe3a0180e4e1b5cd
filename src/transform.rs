//! The user-supplied transform contract.
//!
//! A transform maps one source record to zero or one output record and may
//! fail per record without affecting its neighbours. Per-chunk state lives
//! in an explicit context built by [`Transform::init`] and passed to every
//! [`Transform::apply`] call for that chunk only.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::model::{OutputRecord, SourceRecord};
use crate::store::{DestinationRead, Source};

/// A single-record (or init hook) failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransformError {
    message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TransformError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("schema mapping failed: {e}"))
    }
}

impl From<crate::error::Error> for TransformError {
    fn from(e: crate::error::Error) -> Self {
        Self::new(e.to_string())
    }
}

pub type TransformResult = Result<Option<OutputRecord>, TransformError>;

#[async_trait]
pub trait Transform: Send + Sync {
    /// Per-chunk context. Never shared across chunks or workers.
    type Context: Send;

    /// Build the context for one chunk. Handles are read-only.
    async fn init(
        &self,
        source: &dyn Source,
        destination: &dyn DestinationRead,
    ) -> Result<Self::Context, TransformError>;

    fn apply(&self, context: &mut Self::Context, record: &SourceRecord) -> TransformResult;
}

/// A context-free transform wrapping a plain function.
pub struct FnTransform<F>(F);

/// Lift a function into a [`Transform`] with no init hook.
pub fn transform_fn<F>(f: F) -> FnTransform<F>
where
    F: Fn(&SourceRecord) -> TransformResult + Send + Sync,
{
    FnTransform(f)
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(&SourceRecord) -> TransformResult + Send + Sync,
{
    type Context = ();

    async fn init(&self, _: &dyn Source, _: &dyn DestinationRead) -> Result<(), TransformError> {
        Ok(())
    }

    fn apply(&self, _: &mut (), record: &SourceRecord) -> TransformResult {
        (self.0)(record)
    }
}

/// Compose a schema mapper with a typed function into a record transform.
///
/// `mapper` turns the raw document into `T`; `typed` produces an optional
/// `U`, serialized back into an output document (`_id`, when present,
/// becomes the identity).
pub fn adapt<M, F, T, U>(
    mapper: M,
    typed: F,
) -> FnTransform<impl Fn(&SourceRecord) -> TransformResult + Send + Sync>
where
    M: Fn(&SourceRecord) -> Result<T, TransformError> + Send + Sync,
    F: Fn(T) -> Result<Option<U>, TransformError> + Send + Sync,
    U: Serialize,
{
    transform_fn(move |record: &SourceRecord| {
        let input = mapper(record)?;
        match typed(input)? {
            Some(output) => {
                let document = serde_json::to_value(output)?;
                Ok(Some(OutputRecord::from_document(document)?))
            }
            None => Ok(None),
        }
    })
}

/// Schema mapper deserializing the whole document with serde.
pub fn from_document<T: DeserializeOwned>(record: &SourceRecord) -> Result<T, TransformError> {
    Ok(serde_json::from_value(record.document.clone())?)
}
