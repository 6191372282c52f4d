pub mod agents;
pub mod augment;
pub mod capability;
pub mod cli;
pub mod config;
pub mod crew;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod planner;
pub mod providers;
pub mod strategy;
pub mod telemetry;
