// Presentation layer - Canvas planning for host surfaces
pub mod layout;
