// Application layer - Ports, reactive state and the orchestrator
pub mod binder;
pub mod orchestrator;
pub mod query_backend;
pub mod renderer;
pub mod source_graph;
pub mod token_store;
