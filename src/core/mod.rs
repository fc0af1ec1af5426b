//! Core orchestration logic: types, parsing, graphs, resolution, planning,
//! execution and state.

pub mod executor;
pub mod expr;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod types;
