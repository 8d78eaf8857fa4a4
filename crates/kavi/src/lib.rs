//! # Kavi
//!
//! The forge core of a governed skill-lifecycle system: the trust
//! pipeline that takes a declared capability from proposal through
//! sandboxed code generation, verification, promotion, and
//! hash-verified runtime execution.
//!
//! ## Pipeline
//!
//! The core flow is **propose → build → verify → promote → run**:
//!
//! 1. [`engine::Forge::propose`] stores the spec artifact and opens a
//!    `PROPOSED` ledger row.
//! 2. [`engine::Forge::build`] frames a build packet, runs the external
//!    worker in a sandbox workspace, gates the diff against the
//!    allowlist, and copies allowlisted files back on success.
//! 3. [`engine::Forge::verify`] runs the five-gate battery (ruff, mypy,
//!    pytest, policy scan, invariant check) through the injected
//!    [`process::ToolRunner`].
//! 4. [`engine::Forge::promote`] hashes the skill source, records the
//!    promotion, and rewrites the TRUSTED registry atomically.
//! 5. [`engine::Forge::run`] re-hashes the source, refuses on mismatch,
//!    and executes the skill with schema-validated input and output.
//!
//! Failed attempts flow through [`kavi_classify`] and
//! [`engine::Forge::prepare_retry`], which enriches the next packet and
//! reports the escalation triggers that demand a human decision.
//!
//! ## Key Types
//!
//! - `Forge` — the context value owning config, ledger, and blob store
//! - `ForgeConfig` — all runtime knobs (`.kavi.toml`)
//! - `ToolRunner` — capability interface for every external invocation
//! - `BuildVerdict` / `BuildReport` — sandbox and build outcomes
//! - `VerificationReport` — structured five-gate results
//! - `RetryPlan` — enriched packet plus escalation triggers
//! - `TrustError` — runtime hash mismatch; execution refused
//!
//! ## Modules
//!
//! - [`config`] — configuration file loading and merging
//! - [`engine`] — propose/build/verify/promote/retry/run orchestration
//! - [`events`] — append-only JSONL lifecycle event log
//! - [`git`] — sandbox baseline and delta computation
//! - [`invariants`] — structural, scope, safety, and boundary checks
//! - [`packet`] — build packet framing and retry enrichment
//! - [`process`] — command execution with timeout; `ToolRunner`
//! - [`registry`] — TRUSTED registry view and trust verification
//! - [`retry`] — deterministic enrichment plus bounded LLM advisory
//! - [`runtime`] — trust-verified, schema-validated execution
//! - [`sandbox`] — prepare/invoke/gate/copy-back build driver
//! - [`verify`] — the five-gate verification battery

/// Configuration file (`.kavi.toml`) loading and merging.
pub mod config;

/// Propose/build/verify/promote/retry/run orchestration.
pub mod engine;

/// Append-only JSONL lifecycle event log.
pub mod events;

/// Git operations for the sandbox workspace.
pub mod git;

/// AST-level and filesystem-level contract conformance checks.
pub mod invariants;

/// Build packet framing and retry enrichment.
pub mod packet;

/// Process execution with timeout support; the `ToolRunner` seam.
pub mod process;

/// TRUSTED registry view and load-time trust verification.
pub mod registry;

/// Retry engine: packet enrichment and optional LLM advisory.
pub mod retry;

/// Trust-verified runtime execution.
pub mod runtime;

/// Sandboxed build driver: prepare, invoke, gate, copy-back.
pub mod sandbox;

/// The five-gate verification battery.
pub mod verify;

pub use config::ForgeConfig;
pub use engine::{Forge, NullReporter, Reporter};
pub use process::{StubRunner, SubprocessRunner, ToolRunner};
pub use registry::TrustError;
