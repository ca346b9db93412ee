pub mod record;
pub mod chunker;
pub mod queue;
pub mod prompt;
pub mod extract;
pub mod chat;
pub mod rules;
pub mod repair;
pub mod normalize;
pub mod enrich;
pub mod report;
pub mod config;
pub mod pipeline;
pub mod logging;
