// Dashboard composition engine - declarative definitions to live dashboards
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
