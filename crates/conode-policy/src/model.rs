//! Policy documents.
//!
//! A policy is a list of statements. Each statement names the actions it
//! covers, an effect and a condition expression.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PolicyError, Result};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub statements: Vec<Statement>,
}

impl Policy {
    /// Parse an inline policy from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| PolicyError::InvalidPolicy(e.to_string()))
    }

    /// Statements that cover `action`.
    pub fn statements_for<'a>(
        &'a self,
        action: Action,
    ) -> impl Iterator<Item = &'a Statement> + 'a {
        self.statements
            .iter()
            .filter(move |s| s.actions.iter().any(|a| a == action.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub actions: Vec<String>,
    pub effect: Effect,
    /// Absent means the statement always applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    /// Parameter values used when `policyParams` omits the key.
    #[serde(rename = "policyDefaults", default, skip_serializing_if = "Option::is_none")]
    pub policy_defaults: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Expr {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub constant: Value,
}

impl Expr {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Expr>) -> Self {
        self.args = args;
        self
    }

    pub fn with_constant(mut self, constant: impl Into<Value>) -> Self {
        self.constant = constant.into();
        self
    }
}

/// Actions a policy statement can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Read,
    Post,
    Event,
    Update,
    Delete,
    Associate,
    Subscribe,
    Register,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Post => "post",
            Self::Event => "event",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Associate => "associate",
            Self::Subscribe => "subscribe",
            Self::Register => "register",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of record a policy protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyTarget {
    Message,
    Association,
    Profile,
    Timeline,
    Subscription,
    Entity,
}

impl PolicyTarget {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Association => "association",
            Self::Profile => "profile",
            Self::Timeline => "timeline",
            Self::Subscription => "subscription",
            Self::Entity => "entity",
        }
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
