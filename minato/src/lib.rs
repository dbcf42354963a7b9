#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! Minato is a durable orchestration runtime for LLM agents.
//!
//! Agents are stateful conversations that call tools, delegate to
//! sub-agents, and may suspend mid-run pending out-of-band approval of
//! sensitive tool invocations. The runtime makes runs durable and safely
//! resumable: state is persisted through an abstract keyed cache, mutation
//! is guarded by a per-run distributed lock, and cancellation is a
//! TTL-scoped signal observed cooperatively.
//!
//! # Overview
//!
//! - [`service::AgentService`] — entry points `run`, `stream`, `cancel`.
//! - [`manifest::AgentManifest`] — declarative description of one agent.
//! - [`tool::Tool`] — capabilities, a tagged union over three executor
//!   shapes.
//! - [`provider::LanguageModel`] — the LLM contract; a scripted
//!   [`provider::mock::MockProvider`] ships for tests.
//! - [`state::AgentState`] — the durable record of one run, including
//!   suspension stacks for approvals held by nested sub-agents.
//!
//! The in-memory transports ([`cache::InMemoryKvCache`],
//! [`blob::InMemoryBlobStore`], [`lock::CacheRunLock`]) make the runtime
//! usable single-process out of the box; production deployments inject
//! shared-store implementations of the same traits.

pub mod blob;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod harness;
pub mod hook;
pub mod id;
pub mod lock;
pub mod manifest;
pub mod message;
pub mod provider;
pub mod result;
pub mod service;
pub mod state;
pub mod store;
pub mod streaming;
pub mod tool;
pub mod usage;

mod resume;
mod runner;

pub use config::RuntimeConfig;
pub use context::Context;
pub use error::{Error, ErrorCode, Result};
pub use event::{AgentEvent, EventKind, EventPayload};
pub use id::{AgentId, ApprovalId, RunId, ToolCallId};
pub use manifest::{AgentManifest, ManifestMap, SubAgentRef};
pub use message::{ContentPart, Message, ToolCallPart, ToolResultPart};
pub use result::{AgentInput, AgentRunResult, ApprovalResponse, CancelOutcome};
pub use service::{AgentService, RunSpec};
pub use state::{AgentState, AgentStatus, SuspensionStack, ToolApprovalSuspension};
pub use streaming::{AgentStream, StreamAgentItem};
pub use tool::{Tool, ToolDefinition, ToolOutcome};
pub use usage::Usage;
