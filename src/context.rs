//! The typed request context that flows through the pipeline.
//!
//! Stage-to-stage (and stage-to-caller) communication happens through
//! [`Meta`], a struct of well-known optional fields rather than an untyped
//! string-keyed map - every recognized key from the event/callback surface
//! has a home here.

use std::collections::HashMap;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation carried through the pipeline.
///
/// `is_pinned` marks content the Context Trimmer must never evict (leading
/// system messages, the final user turn) and the Prefix Optimizer treats as
/// eligible for the stable prefix (system messages and tool definitions).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub is_pinned: bool,
    /// Marks tool-definition/tool-schema content, which belongs in the
    /// stable prefix even though its role is not `system`.
    #[serde(default)]
    pub is_tool_definition: bool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            is_pinned: true,
            is_tool_definition: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            is_pinned: false,
            is_tool_definition: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            is_pinned: false,
            is_tool_definition: false,
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            is_pinned: false,
            is_tool_definition: false,
        }
    }

    pub fn tool_definition(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            is_pinned: true,
            is_tool_definition: true,
        }
    }
}

/// Info recorded when the Response Cache short-circuits the pipeline.
#[derive(Debug, Clone)]
pub struct CacheHitInfo {
    pub response: String,
    pub similarity: f64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Typed inter-stage metadata bag.
///
/// Fields correspond one-to-one to the recognized `ctx.meta` keys: `cacheHit`,
/// `contextSaved`, `originalModel`, `prefixSaved`, `routerSaved`,
/// `tierRouted`, `userId`, `userBudgetInflight`, `originalInputTokens`,
/// `complexity`, plus `feature` and `abTestHoldout` used by the ledger and
/// router respectively.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub cache_hit: Option<CacheHitInfo>,
    pub context_saved: u32,
    pub original_model: Option<String>,
    pub prefix_saved: f64,
    pub router_saved: f64,
    pub tier_routed: bool,
    pub user_id: Option<String>,
    pub user_budget_inflight: f64,
    pub original_input_tokens: Option<u32>,
    pub complexity: Option<f64>,
    pub feature: Option<String>,
    pub ab_test_holdout: bool,
    /// Freeform extension point for custom stages, mirroring the source's
    /// untyped bag for anything not promoted to a first-class field.
    pub extra: HashMap<String, String>,
}

/// Per-request state threaded through the pipeline stages.
///
/// Created fresh by the caller before each pipeline run and discarded after
/// the provider call (or abort) completes.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub messages: Vec<Message>,
    pub last_user_text: String,
    pub model_id: String,
    pub meta: Meta,
    pub aborted: bool,
    pub abort_reason: Option<String>,
}

impl PipelineContext {
    /// Build a context from an ordered message list and a target model.
    ///
    /// `last_user_text` is derived as the content of the final `User`
    /// message, matching how every pipeline stage (guard, router) reads it.
    pub fn new(messages: Vec<Message>, model_id: impl Into<String>) -> Self {
        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Self {
            messages,
            last_user_text,
            model_id: model_id.into(),
            meta: Meta::default(),
            aborted: false,
            abort_reason: None,
        }
    }

    /// Abort the pipeline with the given reason. Idempotent: later calls
    /// preserve the first reason set, matching the runner's contract that a
    /// stage never runs twice and abort is terminal.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if !self.aborted {
            self.aborted = true;
            self.abort_reason = Some(reason.into());
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.aborted && self.abort_reason.as_deref() == Some("cache-hit")
    }
}
