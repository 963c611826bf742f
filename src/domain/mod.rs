// Domain layer - Definition documents, tokens, expressions and result frames
pub mod definition;
pub mod error;
pub mod expr;
pub mod result;
pub mod token;
