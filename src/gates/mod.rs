//! Trust gates applied around agent turns.

pub mod taint;

pub use taint::{TaintTracker, ToolTaintRegistry};
