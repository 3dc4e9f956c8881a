pub mod config;
pub mod definition;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod state;
pub mod tree;
