// Synchronous facade over `Field` for callers without an async runtime.
// Owns a small multi-threaded tokio runtime and blocks on each call.
// Calling these methods from inside an async context panics (tokio forbids
// nested `block_on`); async callers should use `Field` directly.

use crate::atoms::error::{FieldError, FieldResult, IngestError};
use crate::atoms::field_types::{FieldConfig, FieldStats};
use crate::engine::field::{Field, GenerateParams, Reply};
use log::info;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub struct BlockingField {
    runtime: Runtime,
    field: Arc<Field>,
}

impl BlockingField {
    pub fn open(config: FieldConfig) -> FieldResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lexfield")
            .enable_all()
            .build()
            .map_err(|e| FieldError::Task(format!("runtime build failed: {e}")))?;
        let field = runtime.block_on(Field::open(config))?;
        info!("[field] Blocking facade ready");
        Ok(Self { runtime, field: Arc::new(field) })
    }

    /// Shared handle to the async field, e.g. for `spawn_maintenance`.
    pub fn field(&self) -> Arc<Field> {
        Arc::clone(&self.field)
    }

    pub fn ingest(&self, text: &str) -> Result<(), IngestError> {
        self.runtime.block_on(self.field.ingest(text))
    }

    pub fn generate(&self, prompt: &str, params: &GenerateParams) -> String {
        self.runtime.block_on(self.field.generate(prompt, params))
    }

    pub fn exchange(&self, prompt: &str, params: &GenerateParams) -> Reply {
        self.runtime.block_on(self.field.exchange(prompt, params))
    }

    pub fn decay(&self) -> FieldResult<usize> {
        self.runtime.block_on(self.field.decay())
    }

    pub fn rebuild_themes(&self) -> FieldResult<usize> {
        self.runtime.block_on(self.field.rebuild_themes())
    }

    pub fn stats(&self) -> FieldStats {
        self.field.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_round_trip() {
        let field = BlockingField::open(FieldConfig { seed: Some(7), ..Default::default() }).unwrap();
        field.ingest("the cat sat on the mat.").unwrap();
        assert_eq!(field.stats().ingest_count, 1);
        let reply = field.generate("the cat", &GenerateParams::default());
        assert!(!reply.is_empty());
        let exchange = field.exchange("where is the cat?", &GenerateParams::default());
        assert!(!exchange.text.is_empty());
        assert_eq!(field.stats().ingest_count, 3);
        assert!(field.decay().is_ok());
    }
}
