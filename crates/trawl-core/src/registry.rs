use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::normalize::Normalizer;
use crate::traits::SourceAdapter;

/// An adapter together with the normalizer that understands its records.
#[derive(Clone)]
pub struct RegisteredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub normalizer: Arc<dyn Normalizer>,
}

/// Source name → adapter map consulted at enqueue and dispatch time.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    sources: Arc<HashMap<String, RegisteredSource>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `adapter.name()`. A later registration with the same
    /// name replaces the earlier one.
    pub fn register(
        mut self,
        adapter: Arc<dyn SourceAdapter>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Self {
        let name = adapter.name().to_string();
        tracing::debug!(source = %name, "Registered source adapter");
        Arc::make_mut(&mut self.sources).insert(name, RegisteredSource { adapter, normalizer });
        self
    }

    pub fn get(&self, source: &str) -> Result<&RegisteredSource, AppError> {
        self.sources
            .get(source)
            .ok_or_else(|| AppError::UnknownSource(source.to_string()))
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Registered source names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
