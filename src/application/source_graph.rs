// Data source graph - Dependency tracking and concurrent query execution
use crate::application::query_backend::{QueryBackend, QueryRequest};
use crate::application::token_store::TokenStore;
use crate::domain::definition::{CellExpr, DataSourceKind, SourceSpec};
use crate::domain::error::DashboardError;
use crate::domain::result::ResultSet;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Execution state of one data source slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceState {
    Pending,
    Ready(Arc<ResultSet>),
    Failed(String),
}

/// Completion message for one execution, tagged with the generation that
/// issued it.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub source: String,
    pub generation: u64,
    pub result: Result<Arc<ResultSet>, String>,
}

struct Slot {
    state: SourceState,
    issued: u64,
    settled_once: bool,
    task: Option<JoinHandle<()>>,
}

struct Registered {
    spec: SourceSpec,
    inline: Option<Arc<ResultSet>>,
}

/// All registered data sources, their token dependency index and execution
/// slots.
///
/// Issuance resolves templates synchronously against the store that is
/// current at call time, so a resolved query is a pure function of template
/// and token values; only the backend call itself runs on a spawned task.
/// Slot state transitions happen in `apply_outcome`, driven by the
/// orchestrator's update loop, and only for the latest issued generation;
/// that is what makes concurrent re-executions last-write-wins.
pub struct SourceGraph {
    backend: Arc<dyn QueryBackend>,
    outcomes: mpsc::UnboundedSender<ExecutionOutcome>,
    sources: BTreeMap<String, Registered>,
    by_token: BTreeMap<String, BTreeSet<String>>,
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl SourceGraph {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        outcomes: mpsc::UnboundedSender<ExecutionOutcome>,
    ) -> Self {
        Self {
            backend,
            outcomes,
            sources: BTreeMap::new(),
            by_token: BTreeMap::new(),
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a compiled source and index its token dependencies. Called
    /// during mount, before the graph is shared.
    pub fn register(&mut self, spec: SourceSpec) {
        for token in &spec.depends_on {
            self.by_token
                .entry(token.clone())
                .or_default()
                .insert(spec.id.clone());
        }
        if let Ok(slots) = self.slots.get_mut() {
            slots.insert(
                spec.id.clone(),
                Slot {
                    state: SourceState::Pending,
                    issued: 0,
                    settled_once: false,
                    task: None,
                },
            );
        }
        let inline = spec.inline_data.clone().map(Arc::new);
        self.sources.insert(spec.id.clone(), Registered { spec, inline });
    }

    /// Resolve and launch one execution of `id` against the current store.
    /// Returns the generation issued, or `None` for unknown ids.
    pub fn issue(&self, id: &str, store: &TokenStore) -> Option<u64> {
        let Some(registered) = self.sources.get(id) else {
            tracing::debug!("issue requested for unknown source {}", id);
            return None;
        };

        let generation = {
            let Ok(mut slots) = self.slots.write() else {
                return None;
            };
            let slot = slots.get_mut(id)?;
            slot.issued += 1;
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.issued
        };

        match registered.spec.kind {
            DataSourceKind::Search => match resolve_request(&registered.spec, store) {
                Ok(request) => {
                    tracing::debug!(
                        "issuing search for {} (generation {}): {}",
                        id,
                        generation,
                        request.query
                    );
                    let backend = self.backend.clone();
                    let outcomes = self.outcomes.clone();
                    let source = id.to_string();
                    let handle = tokio::spawn(async move {
                        let result = match backend.run_query(request).await {
                            Ok(frame) => Ok(Arc::new(frame)),
                            Err(e) => Err(format!("{e:#}")),
                        };
                        let _ = outcomes.send(ExecutionOutcome {
                            source,
                            generation,
                            result,
                        });
                    });
                    if let Ok(mut slots) = self.slots.write() {
                        if let Some(slot) = slots.get_mut(id) {
                            if slot.issued == generation {
                                slot.task = Some(handle);
                            } else {
                                // Superseded while spawning.
                                handle.abort();
                            }
                        }
                    }
                }
                Err(e) => self.send_outcome(id, generation, Err(e.to_string())),
            },
            DataSourceKind::Static => {
                let result = match &registered.inline {
                    Some(frame) => Ok(frame.clone()),
                    None => Err("static source has no inline data".to_string()),
                };
                self.send_outcome(id, generation, result);
            }
            DataSourceKind::Computed => {
                let result = resolve_computed(&registered.spec, store)
                    .map(Arc::new)
                    .map_err(|e| e.to_string());
                self.send_outcome(id, generation, result);
            }
        }

        Some(generation)
    }

    /// Record a completion. Returns the new state when the outcome is
    /// current, `None` when a later issuance superseded it.
    pub fn apply_outcome(&self, outcome: &ExecutionOutcome) -> Option<SourceState> {
        let Ok(mut slots) = self.slots.write() else {
            return None;
        };
        let slot = slots.get_mut(&outcome.source)?;
        if outcome.generation != slot.issued {
            tracing::debug!(
                "discarding stale result for {} (generation {}, latest {})",
                outcome.source,
                outcome.generation,
                slot.issued
            );
            return None;
        }
        slot.state = match &outcome.result {
            Ok(frame) => SourceState::Ready(frame.clone()),
            Err(message) => {
                tracing::error!("source {} failed: {}", outcome.source, message);
                SourceState::Failed(message.clone())
            }
        };
        slot.settled_once = true;
        slot.task = None;
        Some(slot.state.clone())
    }

    pub fn state(&self, id: &str) -> Option<SourceState> {
        self.slots.read().ok()?.get(id).map(|slot| slot.state.clone())
    }

    /// Source ids whose templates read `token`, in id order.
    pub fn dependents_of(&self, token: &str) -> Vec<String> {
        self.by_token
            .get(token)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// True once every registered source has settled at least once.
    pub fn all_settled(&self) -> bool {
        self.slots
            .read()
            .map(|slots| slots.values().all(|slot| slot.settled_once))
            .unwrap_or(false)
    }

    /// Abort every in-flight task and return the handles for joining.
    pub fn abort_all(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Ok(mut slots) = self.slots.write() {
            for slot in slots.values_mut() {
                if let Some(task) = slot.task.take() {
                    task.abort();
                    handles.push(task);
                }
            }
        }
        handles
    }

    fn send_outcome(&self, id: &str, generation: u64, result: Result<Arc<ResultSet>, String>) {
        let _ = self.outcomes.send(ExecutionOutcome {
            source: id.to_string(),
            generation,
            result,
        });
    }
}

fn resolve_request(spec: &SourceSpec, store: &TokenStore) -> Result<QueryRequest, DashboardError> {
    let Some(query_template) = &spec.query else {
        return Err(DashboardError::InvalidDataSource {
            id: spec.id.clone(),
            reason: "search source has no query".to_string(),
        });
    };
    let query = query_template.resolve(store)?;
    let mut parameters = BTreeMap::new();
    for (name, template) in &spec.parameters {
        parameters.insert(name.clone(), template.resolve(store)?);
    }
    Ok(QueryRequest { query, parameters })
}

fn resolve_computed(spec: &SourceSpec, store: &TokenStore) -> Result<ResultSet, DashboardError> {
    let mut rows = Vec::with_capacity(spec.computed_rows.len());
    for row in &spec.computed_rows {
        let mut cells = Vec::with_capacity(row.len());
        for cell in row {
            let value = match cell {
                CellExpr::Literal(value) => value.clone(),
                CellExpr::Template(template) => Value::String(template.resolve(store)?),
            };
            cells.push(value);
        }
        rows.push(cells);
    }
    Ok(ResultSet::new(spec.computed_fields.clone(), rows))
}
