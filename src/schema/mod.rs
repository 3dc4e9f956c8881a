pub mod board;
pub mod connection;
pub mod node;
