#![allow(missing_docs)] // TODO: enforce once the kernel API is stable

//! Straylight — a personal AI runtime kernel.
//!
//! The kernel turns untrusted inbound messages into cryptographically
//! authorized, verifiably executed work items. It owns the approval
//! pipeline (Ed25519 tokens with replay-safe consumption), the taint
//! lattice that tracks trust through tool-call chains, the work-item
//! execution engine (dependency DAG, wave scheduling, per-attempt
//! worktree isolation), and the durable queue bus connecting the proxy,
//! planner, and executor agents with a bounded recovery cascade
//! (retry → consult planner → replan → user escalation).
//!
//! Agent implementations, channel adapters, and skill handler bodies are
//! external collaborators; this crate defines the traits they plug into.

pub mod approval;
pub mod audit;
pub mod canonical;
pub mod config;
pub mod context;
pub mod exec;
pub mod gates;
pub mod goals;
pub mod logging;
pub mod memory;
pub mod persistence;
pub mod queue;
pub mod skills;
pub mod types;
pub mod work;
