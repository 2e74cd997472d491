#![forbid(unsafe_code)]

//! # stage-harness
//!
//! Takes a working set of items through a fixed graph of enrichment stages
//! against a stateful chat backend.
//!
//! Each stage continues the conversation its predecessor left on the backend
//! when it can, and falls back to a self-contained prompt when it cannot.
//! Answers from small models are repaired before validation, failures are
//! classified and retried by policy, and the working set is checkpointed after
//! every batch so an interrupted run resumes where it stopped.

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod conversation;
pub mod gateway;
pub mod item;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod reset;
pub mod retry;
pub mod stages;
pub mod status;
pub mod throttle;
pub mod trace;

pub use checkpoint::{load_working_set, CheckpointError, Checkpointer, WorkingSetLock};
pub use config::{ConfigError, PipelineConfig, ResourceConfig};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, StatefulChatAdapter, UsageSink};
pub use item::{ConversationHandle, ConversationState, Item};
pub use pipeline::{Pipeline, PipelineError, RunOptions, RunSummary};
pub use prompts::{JsonContextPrompts, PromptBuilder, StagePrompt};
pub use stages::{ReadinessPolicy, StageGraph, StageKind, StageRun};
pub use trace::{JsonlTraceSink, TraceError, TraceSink, TraceWorker};
