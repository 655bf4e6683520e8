//! `ExecutionContext`: the in-memory, per-execution state exposed to
//! expressions. Serialized fresh to a `serde_json::Value` tree on every
//! evaluation -- `response` /
//! `parent` / `fanout[*]` are tree-structured copies, never a shared
//! graph, so cloning at fanout entry is the only ownership story needed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::http::ResponseEnvelope;

/// Addressing/bookkeeping fields carried alongside every expression
/// evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub plan_key: String,
    pub config_id: Uuid,
    pub execution_id: Uuid,
    pub step_path: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// The full in-memory state visible to a step's expressions.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub response: Option<ResponseEnvelope>,
    /// The enclosing step's response, set at sub-step entry and never
    /// mutated thereafter.
    pub parent: Option<Box<ResponseEnvelope>>,
    pub item: Option<Value>,
    pub item_index: Option<usize>,
    pub config: Value,
    pub context: HashMap<String, Value>,
    pub auth: Option<AuthContext>,
    pub meta: Meta,
    /// Per-item results accumulated once the current step's fanout
    /// completes, re-ordered by `item_index`.
    pub fanout: Vec<Value>,
    /// `auth_flow_id`s already invalidated once in this execution. Caps a
    /// 401 response to a single token invalidation + retry before the
    /// error is treated as permanent ("retry semantics
    /// after 401".
    pub auth_invalidated: HashSet<Uuid>,
}

impl ExecutionContext {
    pub fn new(
        plan_key: impl Into<String>,
        config_id: Uuid,
        execution_id: Uuid,
        config: Value,
        context: HashMap<String, Value>,
    ) -> Self {
        Self {
            response: None,
            parent: None,
            item: None,
            item_index: None,
            config,
            context,
            auth: None,
            meta: Meta {
                plan_key: plan_key.into(),
                config_id,
                execution_id,
                step_path: "root".to_owned(),
                timestamp: Utc::now(),
                attempt: 0,
            },
            fanout: Vec::new(),
            auth_invalidated: HashSet::new(),
        }
    }

    /// Derive a child context for one fanout item: `parent` becomes this
    /// step's response, `item`/`item_index` are set and never mutated
    /// again, `step_path` gets the `[i]` suffix.
    pub fn derive_for_item(&self, item: Value, item_index: usize) -> Self {
        let mut child = self.clone();
        child.parent = self.response.clone().map(Box::new);
        child.item = Some(item);
        child.item_index = Some(item_index);
        child.fanout = Vec::new();
        child.meta.step_path = format!("{}[{}]", self.meta.step_path, item_index);
        child
    }

    /// Build the plain `serde_json::Value` map expressions evaluate
    /// against: `{ response, parent, item, item_index, config, context,
    /// auth, meta }`. `response.fanout` is merged in when non-empty.
    pub fn to_value(&self) -> Value {
        let response_value = self.response.as_ref().map(|r| {
            let mut v = r.to_value();
            if !self.fanout.is_empty() {
                if let Value::Object(ref mut map) = v {
                    map.insert("fanout".to_owned(), Value::Array(self.fanout.clone()));
                }
            }
            v
        });

        serde_json::json!({
            "response": response_value,
            "parent": self.parent.as_ref().map(|p| p.to_value()),
            "item": self.item,
            "item_index": self.item_index,
            "config": self.config,
            "context": self.context,
            "auth": self.auth.as_ref().map(|a| a.to_value()),
            "meta": self.meta,
        })
    }

    /// Merge a `set_context` result into the in-memory context bag,
    /// visible to subsequent steps in the same execution.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }
}
