// Renderer plugins - host-side visualization surfaces keyed by type string
use crate::domain::result::OptionValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One reactive update for a visualization: the complete resolved option
/// map, not a delta.
#[derive(Debug, Clone)]
pub struct RenderUpdate {
    pub visualization: String,
    pub options: BTreeMap<String, OptionValue>,
}

/// Host-side rendering surface for one visualization instance. Implementors
/// receive the full option map on every reactive update and must tolerate
/// repeated `apply` calls.
pub trait Renderer: Send {
    fn apply(&mut self, update: RenderUpdate);

    /// A bound data source failed; present the error instead of stale
    /// options.
    fn show_error(&mut self, message: &str);
}

type RendererCtor = Arc<dyn Fn() -> Box<dyn Renderer> + Send + Sync>;

/// Maps visualization type strings to renderer factories. Types without a
/// registered factory are tolerated: the visualization still binds and its
/// options stay queryable, it just never draws.
#[derive(Clone, Default)]
pub struct RendererRegistry {
    map: HashMap<String, RendererCtor>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, R>(&mut self, kind: &str, build: F)
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Renderer + 'static,
    {
        self.map
            .insert(kind.to_string(), Arc::new(move || Box::new(build())));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.map.contains_key(kind)
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Renderer>> {
        self.map.get(kind).map(|ctor| ctor())
    }
}
