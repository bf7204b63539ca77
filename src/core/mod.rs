pub mod config;
pub mod events;
pub mod export;
pub mod job;
pub mod llm;
pub mod parser;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod terminal;
