//! Assertion engine for testplane
//!
//! Expectations name a function. The function is either registered
//! in-process in a [`FunctionRegistry`] or served by an HTTP webhook. The
//! [`Evaluator`] combines both behind AllOf/AnyOf semantics and produces
//! summaries suitable for storing in test status.

#![deny(missing_docs)]

pub mod builtin;
pub mod engine;
pub mod registry;
pub mod webhook;

pub use builtin::register_builtins;
pub use engine::{
    select_subject, summarize, truncate_message, ConditionOutcome, Evaluator,
    SUMMARY_MESSAGE_LIMIT,
};
pub use registry::{AssertionFunction, FunctionRegistry, FunctionResult};
pub use webhook::{HttpWebhookClient, WebhookClient, DEFAULT_WEBHOOK_TIMEOUT};
