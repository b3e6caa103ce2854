//! Model capability
//!
//! The engine treats models as opaque: it only calls [`Model::predict`],
//! [`Model::learn`] and [`Model::save`]. Snapshots travel as a versioned
//! [`envelope`] tagged with the model kind, and a [`ModelRegistry`] maps each kind
//! back to a decoder. A kind that was never registered cannot be used by an
//! experiment.
//!
//! ## Example
//!
//! ```rust
//! use beaver::model::{MajorityClass, Model, ModelRegistry};
//! use serde_json::json;
//!
//! # fn main() -> beaver::Result<()> {
//! let registry = ModelRegistry::with_builtins();
//!
//! let mut model = MajorityClass::default();
//! model.learn(&json!({"len": 3}), &json!("spam")).unwrap();
//!
//! let bytes = registry.seal(&model)?;
//! let mut restored = registry.open(&bytes)?;
//! assert_eq!(restored.kind(), "majority_class");
//! assert_eq!(restored.predict(&json!({"len": 9})).unwrap(), json!("spam"));
//! # Ok(())
//! # }
//! ```

mod builtin;
pub mod envelope;

pub use builtin::{LogisticRegression, MajorityClass};
pub use envelope::{Compression, ModelEnvelope};

use std::fmt;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{Error, Result};

/// Failure reported by a model implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ModelError {
    message: String,
}

impl ModelError {
    /// Create an error with a human-readable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// An incrementally trained model.
///
/// `predict` takes `&mut self` so stateful models (caches, counters) can update on
/// inference; the engine snapshots the model after every committed cycle either way.
pub trait Model: Send {
    /// Registered kind, written into the envelope.
    fn kind(&self) -> &str;

    /// Predict a target for one feature value.
    ///
    /// # Errors
    ///
    /// Implementations return `ModelError` for inputs they cannot handle.
    fn predict(&mut self, features: &Value) -> std::result::Result<Value, ModelError>;

    /// Update the model with one labelled example.
    ///
    /// # Errors
    ///
    /// Implementations return `ModelError` for inputs they cannot handle.
    fn learn(&mut self, features: &Value, target: &Value) -> std::result::Result<(), ModelError>;

    /// Serialize the model state (the envelope payload).
    ///
    /// # Errors
    ///
    /// Implementations return `ModelError` if the state cannot be encoded.
    fn save(&self) -> std::result::Result<Vec<u8>, ModelError>;
}

/// A model whose state is its serde representation, registered under a fixed kind.
///
/// Implementors get a JSON payload decoder from [`ModelRegistry::register`].
pub trait NamedModel: Model + Serialize + DeserializeOwned + 'static {
    /// Kind string stored in envelopes.
    const KIND: &'static str;
}

type Decoder = Box<dyn Fn(&[u8]) -> std::result::Result<Box<dyn Model>, ModelError> + Send + Sync>;

/// Kind → decoder table plus the compression used when sealing snapshots.
pub struct ModelRegistry {
    decoders: FxHashMap<String, Decoder>,
    compression: Compression,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("kinds", &self.kinds())
            .field("compression", &self.compression)
            .finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Empty registry, uncompressed snapshots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: FxHashMap::default(),
            compression: Compression::None,
        }
    }

    /// Registry with [`MajorityClass`] and [`LogisticRegression`] registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register::<MajorityClass>();
        registry.register::<LogisticRegression>();
        registry
    }

    /// Register a serde-backed model kind (replaces an earlier registration).
    pub fn register<M: NamedModel>(&mut self) -> &mut Self {
        self.register_decoder(M::KIND, |payload| {
            let model: M = serde_json::from_slice(payload)?;
            Ok(Box::new(model) as Box<dyn Model>)
        })
    }

    /// Register a custom decoder for `kind`.
    pub fn register_decoder<F>(&mut self, kind: impl Into<String>, decoder: F) -> &mut Self
    where
        F: Fn(&[u8]) -> std::result::Result<Box<dyn Model>, ModelError> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.into(), Box::new(decoder));
        self
    }

    /// Set the compression used by [`ModelRegistry::seal`].
    pub fn set_compression(&mut self, compression: Compression) -> &mut Self {
        self.compression = compression;
        self
    }

    /// Compression used when sealing.
    #[must_use]
    pub const fn compression(&self) -> Compression {
        self.compression
    }

    /// Whether `kind` can be decoded.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Snapshot a model into envelope bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Envelope` if the kind is unregistered, `save` fails, or the
    /// envelope cannot be encoded.
    pub fn seal(&self, model: &dyn Model) -> Result<Vec<u8>> {
        let kind = model.kind();
        if !self.contains(kind) {
            return Err(Error::Envelope(format!("unknown model kind '{kind}'")));
        }
        let payload = model
            .save()
            .map_err(|e| Error::Envelope(format!("failed to save {kind} model: {e}")))?;
        ModelEnvelope::new(kind, payload).encode(self.compression)
    }

    /// Decode envelope bytes into a live model.
    ///
    /// # Errors
    ///
    /// Returns `Error::Envelope` for malformed envelopes, unregistered kinds, or
    /// payloads the decoder rejects.
    pub fn open(&self, bytes: &[u8]) -> Result<Box<dyn Model>> {
        let envelope = ModelEnvelope::decode(bytes)?;
        let decoder = self
            .decoders
            .get(envelope.kind())
            .ok_or_else(|| Error::Envelope(format!("unknown model kind '{}'", envelope.kind())))?;
        decoder(envelope.payload()).map_err(|e| {
            Error::Envelope(format!("failed to decode {} model: {e}", envelope.kind()))
        })
    }
}
