// Dashboard orchestrator - Mount, reactive token updates and the event stream
use crate::application::binder::{Binder, BinderEffect};
use crate::application::query_backend::QueryBackend;
use crate::application::renderer::RendererRegistry;
use crate::application::source_graph::{ExecutionOutcome, SourceGraph, SourceState};
use crate::application::token_store::TokenStore;
use crate::domain::definition::{
    CompiledDashboard, DashboardDefinition, InputKind, InputSpec, TabSpec,
};
use crate::domain::error::DashboardError;
use crate::domain::result::OptionValue;
use crate::domain::token::TokenValue;
use crate::presentation::layout::{CanvasPlan, LayoutEngine};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Progress notifications for hosts that want to mirror the dashboard's
/// loading state. `Settled` fires once, after every registered source has
/// settled at least once.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    SourceSettled { source: String },
    VisualizationUpdated { visualization: String },
    VisualizationErrored { visualization: String, message: String },
    Settled { sources: usize, elapsed_ms: u64 },
}

/// State shared between the dashboard handle and its update loop task.
struct Shared {
    store: RwLock<TokenStore>,
    graph: SourceGraph,
    binder: StdMutex<Binder>,
    events: mpsc::UnboundedSender<DashboardEvent>,
}

/// A mounted dashboard: the live composition of one definition document.
///
/// Mutation goes through `set_input`/`set_token`, serialized by an async
/// update lock; by the time either returns, the store is written, every
/// dependent source has been re-issued against the new values and dependent
/// token templates have re-evaluated. Query completions arrive on the update
/// loop task, which owns slot state transitions.
pub struct Dashboard {
    shared: Arc<Shared>,
    inputs: BTreeMap<String, InputSpec>,
    layout: LayoutEngine,
    active_tab: usize,
    title: String,
    description: String,
    warnings: Vec<String>,
    update_lock: Mutex<()>,
    events_rx: Option<mpsc::UnboundedReceiver<DashboardEvent>>,
    loop_task: Option<JoinHandle<()>>,
}

// Manual impl: the shared graph and binder hold trait objects with no Debug
// bound, so the derive is unavailable.
impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("title", &self.title)
            .field("description", &self.description)
            .field("active_tab", &self.active_tab)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl Dashboard {
    /// Validate `definition` and bring it up: install input defaults,
    /// register data sources, bind visualizations, create renderers for
    /// placed visualizations, start the update loop and issue the initial
    /// execution of every source. Structural problems fail here, before
    /// anything runs.
    pub async fn mount(
        definition: DashboardDefinition,
        backend: Arc<dyn QueryBackend>,
        renderers: RendererRegistry,
    ) -> Result<Self, DashboardError> {
        let started = Instant::now();
        let CompiledDashboard {
            title,
            description,
            inputs,
            sources,
            visualizations,
            layouts,
            tabs,
            global_inputs,
            mut warnings,
        } = definition.compile()?;

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut graph = SourceGraph::new(backend, outcome_tx);
        for spec in sources.into_values() {
            graph.register(spec);
        }

        let (layout, layout_warnings) = LayoutEngine::new(layouts, tabs, global_inputs);
        warnings.extend(layout_warnings);

        let placed = layout.placed_blocks();
        let mut binder = Binder::new();
        for (id, spec) in visualizations {
            let renderer = if placed.contains(&id) {
                match renderers.create(&spec.kind) {
                    Some(renderer) => Some(renderer),
                    None => {
                        warnings.push(format!(
                            "visualization `{id}`: no renderer registered for type `{}`; it will not be drawn",
                            spec.kind
                        ));
                        None
                    }
                }
            } else {
                None
            };
            binder.register(spec, renderer);
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let mut store = TokenStore::new();
        for input in inputs.values() {
            if let Some(default) = &input.default_value {
                store.set(&input.token, input.kind.token_value(default));
            }
        }

        let shared = Arc::new(Shared {
            store: RwLock::new(store),
            graph,
            binder: StdMutex::new(binder),
            events: event_tx,
        });

        let loop_task = tokio::spawn(update_loop(shared.clone(), outcome_rx, started));

        let dashboard = Self {
            shared: shared.clone(),
            inputs,
            layout,
            active_tab: 0,
            title,
            description,
            warnings,
            update_lock: Mutex::new(()),
            events_rx: Some(event_rx),
            loop_task: Some(loop_task),
        };

        {
            let _guard = dashboard.update_lock.lock().await;
            if let Ok(store) = shared.store.read() {
                // Role-free visualizations render before any query returns.
                let effects = match shared.binder.lock() {
                    Ok(mut binder) => binder.evaluate_all(&store, &shared.graph),
                    Err(_) => Vec::new(),
                };
                emit_effects(&shared.events, effects);

                for id in shared.graph.ids() {
                    shared.graph.issue(&id, &store);
                }
            }
        }
        if shared.graph.is_empty() {
            let _ = shared.events.send(DashboardEvent::Settled {
                sources: 0,
                elapsed_ms: 0,
            });
        }

        Ok(dashboard)
    }

    /// Submit a raw value for a declared input. The value is converted per
    /// the input's type and drives its token.
    pub async fn set_input(&self, input_id: &str, raw: &str) -> Result<(), DashboardError> {
        let Some(input) = self.inputs.get(input_id) else {
            return Err(DashboardError::UnknownInput {
                id: input_id.to_string(),
            });
        };
        if input.kind == InputKind::Dropdown
            && !input.items.is_empty()
            && !input.items.iter().any(|item| item.value == raw)
        {
            // Dropdowns accept values outside their item list.
            tracing::debug!("input {} takes free value {:?}", input_id, raw);
        }
        let token = input.token.clone();
        let value = input.kind.token_value(raw);
        self.set_token(&token, value).await;
        Ok(())
    }

    /// Write one token and propagate: re-issue every dependent source and
    /// re-evaluate every dependent token template. Setting a token to its
    /// current value does nothing.
    pub async fn set_token(&self, name: &str, value: TokenValue) {
        let _guard = self.update_lock.lock().await;
        let changed = match self.shared.store.write() {
            Ok(mut store) => store.set(name, value),
            Err(_) => return,
        };
        if changed.is_empty() {
            tracing::debug!("token {} unchanged; nothing to issue", name);
            return;
        }

        let Ok(store) = self.shared.store.read() else {
            return;
        };
        for token in &changed {
            for id in self.shared.graph.dependents_of(token) {
                self.shared.graph.issue(&id, &store);
            }
        }
        let effects = match self.shared.binder.lock() {
            Ok(mut binder) => binder.on_tokens_changed(&changed, &store, &self.shared.graph),
            Err(_) => Vec::new(),
        };
        emit_effects(&self.shared.events, effects);
    }

    /// The event stream. Takeable once; later calls return `None`.
    pub fn events(&mut self) -> Option<UnboundedReceiverStream<DashboardEvent>> {
        self.events_rx.take().map(UnboundedReceiverStream::new)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Non-fatal findings from validation, layout planning and renderer
    /// lookup, in the order they were discovered.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn input(&self, id: &str) -> Option<&InputSpec> {
        self.inputs.get(id)
    }

    pub fn token(&self, name: &str) -> Option<TokenValue> {
        self.shared.store.read().ok()?.get(name).ok().cloned()
    }

    pub fn source_state(&self, id: &str) -> Option<SourceState> {
        self.shared.graph.state(id)
    }

    /// Latest resolved option map for a visualization, whether or not it is
    /// placed in any layout.
    pub fn visualization_options(&self, id: &str) -> Option<BTreeMap<String, OptionValue>> {
        self.shared.binder.lock().ok()?.options(id)
    }

    pub fn tabs(&self) -> &[TabSpec] {
        self.layout.tabs()
    }

    pub fn active_tab(&self) -> usize {
        self.active_tab
    }

    /// Switch the visible tab. Sources and bindings are unaffected; tabs
    /// share one live dashboard.
    pub fn set_active_tab(&mut self, index: usize) -> Result<(), DashboardError> {
        if index >= self.layout.tabs().len() {
            return Err(DashboardError::UnknownTab { index });
        }
        self.active_tab = index;
        Ok(())
    }

    /// Placement plan for the active tab's layout.
    pub fn canvas(&self) -> Result<CanvasPlan, DashboardError> {
        let tab = self.layout.tab(self.active_tab)?;
        self.layout.plan(tab)
    }

    /// Stop the update loop, abort in-flight executions and wait for them
    /// to wind down.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
            let _ = task.await;
        }
        let handles = self.shared.graph.abort_all();
        let _ = futures::future::join_all(handles).await;
        tracing::debug!("dashboard unmounted");
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
        self.shared.graph.abort_all();
    }
}

/// Single consumer of execution outcomes: applies the generation check,
/// writes the slot, lets the binder react and forwards events.
async fn update_loop(
    shared: Arc<Shared>,
    mut outcomes: mpsc::UnboundedReceiver<ExecutionOutcome>,
    started: Instant,
) {
    let mut settled_emitted = false;
    while let Some(outcome) = outcomes.recv().await {
        let source = outcome.source.clone();
        if shared.graph.apply_outcome(&outcome).is_none() {
            continue;
        }
        let _ = shared.events.send(DashboardEvent::SourceSettled {
            source: source.clone(),
        });

        let effects = {
            let Ok(store) = shared.store.read() else {
                continue;
            };
            match shared.binder.lock() {
                Ok(mut binder) => binder.on_source_settled(&source, &store, &shared.graph),
                Err(_) => Vec::new(),
            }
        };
        emit_effects(&shared.events, effects);

        if !settled_emitted && shared.graph.all_settled() {
            settled_emitted = true;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(
                "all {} sources settled in {}ms",
                shared.graph.len(),
                elapsed_ms
            );
            let _ = shared.events.send(DashboardEvent::Settled {
                sources: shared.graph.len(),
                elapsed_ms,
            });
        }
    }
}

fn emit_effects(events: &mpsc::UnboundedSender<DashboardEvent>, effects: Vec<BinderEffect>) {
    for effect in effects {
        let event = match effect {
            BinderEffect::Updated { visualization } => {
                DashboardEvent::VisualizationUpdated { visualization }
            }
            BinderEffect::Errored {
                visualization,
                message,
            } => DashboardEvent::VisualizationErrored {
                visualization,
                message,
            },
        };
        let _ = events.send(event);
    }
}
