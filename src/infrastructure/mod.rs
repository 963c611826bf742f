// Infrastructure layer - External dependencies and adapters
pub mod loader;
pub mod rest_backend;
pub mod settings;
