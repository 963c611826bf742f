// Visualization binder - Role resolution and reactive option evaluation
use crate::application::renderer::{RenderUpdate, Renderer};
use crate::application::source_graph::{SourceGraph, SourceState};
use crate::application::token_store::TokenStore;
use crate::domain::definition::{OptionExpr, VizSpec};
use crate::domain::result::{OptionValue, ResultSet};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What one re-evaluation did, for the orchestrator's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BinderEffect {
    Updated { visualization: String },
    Errored { visualization: String, message: String },
}

enum Evaluation {
    /// Some bound role has not settled yet, or a token template is still
    /// waiting for its token. The previous presentation stays up.
    NotReady,
    Errored(String),
    Rendered(BTreeMap<String, OptionValue>),
}

struct Binding {
    spec: VizSpec,
    renderer: Option<Box<dyn Renderer>>,
    resolved: Option<BTreeMap<String, OptionValue>>,
    errored: Option<String>,
}

/// Connects visualizations to their data sources and keeps their resolved
/// option maps current.
///
/// A visualization renders only once every bound role has settled (Ready or
/// Failed) at least once; visualizations without roles are trivially settled
/// and render at mount. Re-evaluation is targeted: a settled source touches
/// only the visualizations bound to it, a token change only those whose
/// templates read a changed token.
#[derive(Default)]
pub struct Binder {
    bindings: BTreeMap<String, Binding>,
    by_source: BTreeMap<String, BTreeSet<String>>,
    by_token: BTreeMap<String, BTreeSet<String>>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled visualization, with a renderer instance when its
    /// type has one. Unrendered visualizations still bind and stay
    /// addressable through `options`.
    pub fn register(&mut self, spec: VizSpec, renderer: Option<Box<dyn Renderer>>) {
        for source in spec.roles.values() {
            self.by_source
                .entry(source.clone())
                .or_default()
                .insert(spec.id.clone());
        }
        for token in &spec.token_deps {
            self.by_token
                .entry(token.clone())
                .or_default()
                .insert(spec.id.clone());
        }
        self.bindings.insert(
            spec.id.clone(),
            Binding {
                spec,
                renderer,
                resolved: None,
                errored: None,
            },
        );
    }

    /// Re-evaluate every visualization bound to `source`.
    pub fn on_source_settled(
        &mut self,
        source: &str,
        store: &TokenStore,
        graph: &SourceGraph,
    ) -> Vec<BinderEffect> {
        let ids: Vec<String> = self
            .by_source
            .get(source)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        self.refresh(&ids, store, graph)
    }

    /// Re-evaluate every visualization whose templates read a changed token.
    pub fn on_tokens_changed(
        &mut self,
        changed: &BTreeSet<String>,
        store: &TokenStore,
        graph: &SourceGraph,
    ) -> Vec<BinderEffect> {
        let mut ids = BTreeSet::new();
        for token in changed {
            if let Some(dependents) = self.by_token.get(token) {
                ids.extend(dependents.iter().cloned());
            }
        }
        let ids: Vec<String> = ids.into_iter().collect();
        self.refresh(&ids, store, graph)
    }

    /// Evaluate everything once; used at mount so role-free visualizations
    /// render immediately.
    pub fn evaluate_all(&mut self, store: &TokenStore, graph: &SourceGraph) -> Vec<BinderEffect> {
        let ids: Vec<String> = self.bindings.keys().cloned().collect();
        self.refresh(&ids, store, graph)
    }

    /// Last successfully resolved option map for a visualization, placed in
    /// a layout or not.
    pub fn options(&self, id: &str) -> Option<BTreeMap<String, OptionValue>> {
        self.bindings.get(id)?.resolved.clone()
    }

    fn refresh(
        &mut self,
        ids: &[String],
        store: &TokenStore,
        graph: &SourceGraph,
    ) -> Vec<BinderEffect> {
        let mut effects = Vec::new();
        for id in ids {
            let Some(binding) = self.bindings.get_mut(id) else {
                continue;
            };
            match evaluate_spec(&binding.spec, store, graph) {
                Evaluation::NotReady => {}
                Evaluation::Rendered(options) => {
                    if binding.errored.is_none() && binding.resolved.as_ref() == Some(&options) {
                        continue;
                    }
                    binding.errored = None;
                    binding.resolved = Some(options.clone());
                    if let Some(renderer) = binding.renderer.as_mut() {
                        renderer.apply(RenderUpdate {
                            visualization: id.clone(),
                            options,
                        });
                    }
                    effects.push(BinderEffect::Updated {
                        visualization: id.clone(),
                    });
                }
                Evaluation::Errored(message) => {
                    if binding.errored.as_ref() == Some(&message) {
                        continue;
                    }
                    binding.errored = Some(message.clone());
                    if let Some(renderer) = binding.renderer.as_mut() {
                        renderer.show_error(&message);
                    }
                    effects.push(BinderEffect::Errored {
                        visualization: id.clone(),
                        message,
                    });
                }
            }
        }
        effects
    }
}

fn evaluate_spec(spec: &VizSpec, store: &TokenStore, graph: &SourceGraph) -> Evaluation {
    let mut frames: BTreeMap<&str, Arc<ResultSet>> = BTreeMap::new();
    for (role, source) in &spec.roles {
        match graph.state(source) {
            Some(SourceState::Ready(frame)) => {
                frames.insert(role.as_str(), frame);
            }
            Some(SourceState::Failed(message)) => {
                return Evaluation::Errored(format!("data source `{source}` failed: {message}"));
            }
            Some(SourceState::Pending) | None => return Evaluation::NotReady,
        }
    }

    let mut resolved = BTreeMap::new();
    for (name, expr) in &spec.options {
        let value = match expr {
            OptionExpr::Literal(value) => OptionValue::Literal(value.clone()),
            OptionExpr::Template(template) => match template.resolve(store) {
                Ok(text) => OptionValue::Text(text),
                Err(e) => {
                    tracing::debug!(
                        "visualization {} option {} is waiting for a token: {}",
                        spec.id,
                        name,
                        e
                    );
                    return Evaluation::NotReady;
                }
            },
            OptionExpr::Pipeline(pipeline) => {
                let Some(frame) = frames.get(pipeline.role.as_str()) else {
                    return Evaluation::NotReady;
                };
                match pipeline.evaluate(frame) {
                    Ok(value) => value,
                    Err(e) => return Evaluation::Errored(e.to_string()),
                }
            }
        };
        resolved.insert(name.clone(), value);
    }
    Evaluation::Rendered(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::query_backend::{QueryBackend, QueryRequest};
    use crate::application::source_graph::ExecutionOutcome;
    use crate::domain::definition::DashboardDefinition;
    use crate::domain::token::TokenValue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct NoopBackend;

    #[async_trait]
    impl QueryBackend for NoopBackend {
        async fn run_query(&self, _request: QueryRequest) -> anyhow::Result<ResultSet> {
            Ok(ResultSet::default())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingRenderer {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Renderer for RecordingRenderer {
        fn apply(&mut self, update: RenderUpdate) {
            self.log
                .lock()
                .unwrap()
                .push(format!("apply {}", update.visualization));
        }

        fn show_error(&mut self, message: &str) {
            self.log.lock().unwrap().push(format!("error {message}"));
        }
    }

    struct Fixture {
        binder: Binder,
        graph: SourceGraph,
        store: TokenStore,
        outcomes: mpsc::UnboundedReceiver<ExecutionOutcome>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(doc: serde_json::Value) -> Fixture {
        let definition: DashboardDefinition = serde_json::from_value(doc).unwrap();
        let compiled = definition.compile().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut graph = SourceGraph::new(Arc::new(NoopBackend), tx);
        for spec in compiled.sources.into_values() {
            graph.register(spec);
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut binder = Binder::new();
        for spec in compiled.visualizations.into_values() {
            let renderer = RecordingRenderer { log: log.clone() };
            binder.register(spec, Some(Box::new(renderer)));
        }
        Fixture {
            binder,
            graph,
            store: TokenStore::new(),
            outcomes: rx,
            log,
        }
    }

    /// Drive one already-issued outcome from the channel into the graph.
    fn settle_next(fx: &mut Fixture) -> String {
        let outcome = fx.outcomes.try_recv().unwrap();
        let source = outcome.source.clone();
        fx.graph.apply_outcome(&outcome).unwrap();
        source
    }

    #[tokio::test]
    async fn role_free_visualizations_render_at_mount() {
        let mut fx = fixture(json!({
            "visualizations": {
                "viz_notes": {
                    "type": "viz.markdown",
                    "options": { "markdown": "Steady text" }
                }
            }
        }));
        let effects = fx.binder.evaluate_all(&fx.store, &fx.graph);
        assert_eq!(
            effects,
            vec![BinderEffect::Updated {
                visualization: "viz_notes".to_string()
            }]
        );
        assert_eq!(fx.log.lock().unwrap().as_slice(), ["apply viz_notes"]);
    }

    #[tokio::test]
    async fn rendering_waits_for_every_bound_role() {
        let mut fx = fixture(json!({
            "dataSources": {
                "ds_a": { "type": "ds.static",
                          "options": { "data": { "fields": ["x"], "rows": [[1]] } } },
                "ds_b": { "type": "ds.static",
                          "options": { "data": { "fields": ["y"], "rows": [[2]] } } }
            },
            "visualizations": {
                "viz_chart": {
                    "type": "viz.line",
                    "dataSources": { "primary": "ds_a", "annotation": "ds_b" },
                    "options": { "y": "> primary | seriesByName('x')" }
                }
            }
        }));

        fx.graph.issue("ds_a", &fx.store);
        let settled = settle_next(&mut fx);
        let effects = fx.binder.on_source_settled(&settled, &fx.store, &fx.graph);
        assert!(effects.is_empty(), "one pending role must gate rendering");

        fx.graph.issue("ds_b", &fx.store);
        let settled = settle_next(&mut fx);
        let effects = fx.binder.on_source_settled(&settled, &fx.store, &fx.graph);
        assert_eq!(effects.len(), 1);
        let options = fx.binder.options("viz_chart").unwrap();
        assert_eq!(
            options["y"],
            OptionValue::Series {
                name: "x".to_string(),
                values: vec![json!(1)]
            }
        );
    }

    #[tokio::test]
    async fn failed_roles_present_an_error_instead_of_options() {
        let mut fx = fixture(json!({
            "dataSources": {
                "ds_bad": { "type": "ds.computed",
                            "options": { "fields": ["q"], "rows": [["$missing$"]] } }
            },
            "visualizations": {
                "viz_chart": {
                    "type": "viz.line",
                    "dataSources": { "primary": "ds_bad" },
                    "options": { "y": "> primary | seriesByName('q')" }
                }
            }
        }));

        fx.graph.issue("ds_bad", &fx.store);
        let settled = settle_next(&mut fx);
        let effects = fx.binder.on_source_settled(&settled, &fx.store, &fx.graph);
        assert!(matches!(effects[0], BinderEffect::Errored { .. }));
        let log = fx.log.lock().unwrap();
        assert!(log[0].starts_with("error "), "{log:?}");
    }

    #[tokio::test]
    async fn token_changes_touch_only_dependent_visualizations() {
        let mut fx = fixture(json!({
            "visualizations": {
                "viz_echo": {
                    "type": "viz.markdown",
                    "options": { "markdown": "Query: $text_mainSPL$" }
                },
                "viz_notes": {
                    "type": "viz.markdown",
                    "options": { "markdown": "Steady text" }
                }
            }
        }));
        fx.store
            .set("text_mainSPL", TokenValue::scalar("index=main"));
        fx.binder.evaluate_all(&fx.store, &fx.graph);
        fx.log.lock().unwrap().clear();

        let changed = fx
            .store
            .set("text_mainSPL", TokenValue::scalar("index=other"));
        let effects = fx.binder.on_tokens_changed(&changed, &fx.store, &fx.graph);
        assert_eq!(
            effects,
            vec![BinderEffect::Updated {
                visualization: "viz_echo".to_string()
            }]
        );
        assert_eq!(fx.log.lock().unwrap().as_slice(), ["apply viz_echo"]);
        let options = fx.binder.options("viz_echo").unwrap();
        assert_eq!(options["markdown"], OptionValue::Text("Query: index=other".to_string()));
    }

    #[tokio::test]
    async fn unchanged_results_do_not_re_render() {
        let mut fx = fixture(json!({
            "visualizations": {
                "viz_echo": {
                    "type": "viz.markdown",
                    "options": { "markdown": "Query: $text_mainSPL$" }
                }
            }
        }));
        fx.store
            .set("text_mainSPL", TokenValue::scalar("index=main"));
        fx.binder.evaluate_all(&fx.store, &fx.graph);
        let effects = fx.binder.evaluate_all(&fx.store, &fx.graph);
        assert!(effects.is_empty());
        assert_eq!(fx.log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn templates_without_their_token_keep_waiting() {
        let mut fx = fixture(json!({
            "visualizations": {
                "viz_echo": {
                    "type": "viz.markdown",
                    "options": { "markdown": "Query: $text_mainSPL$" }
                }
            }
        }));
        let effects = fx.binder.evaluate_all(&fx.store, &fx.graph);
        assert!(effects.is_empty());
        assert!(fx.binder.options("viz_echo").is_none());
    }
}
