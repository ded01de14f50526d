//! Query-time decision stages: chunk budgeting and tool routing.

pub mod chunk_budget;
pub mod router;

pub use chunk_budget::{allocate, doc_total_chars};
pub use router::{has_correlation_intent, keyword_route, QueryRouter};
