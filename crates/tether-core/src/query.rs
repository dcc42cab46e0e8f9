// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation queries and instance key calculation.
//!
//! A [`CorrelationQuery`] pairs an action filter with one or more query sets.
//! The [`CorrelationKeyCalculator`] picks the first query whose filter
//! matches a message and evaluates its sets into instance keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TetherError};
use crate::key::{InstanceKey, InstanceValue};
use crate::message::Message;

/// Expression selecting one value from a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryExpression {
    /// The resolved action.
    Action,
    /// A header value.
    Header(String),
    /// A JSON pointer into the body, e.g. `/order/id`.
    Body(String),
    /// A constant.
    Literal(String),
}

impl QueryExpression {
    /// Evaluate against a message; `None` when the value is absent.
    pub fn evaluate(&self, message: &Message) -> Option<String> {
        match self {
            Self::Action => Some(message.resolved_action().to_string()),
            Self::Header(name) => message.header(name).map(str::to_string),
            Self::Body(pointer) => message.body().pointer(pointer).and_then(|value| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }),
            Self::Literal(value) => Some(value.clone()),
        }
    }
}

/// Named expressions evaluated together into one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageQuerySet {
    /// Optional set name, used to scope additional keys.
    pub name: Option<String>,
    /// Expressions by key-data name.
    pub queries: BTreeMap<String, QueryExpression>,
}

impl MessageQuerySet {
    /// Empty unnamed set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an expression.
    pub fn with(mut self, name: impl Into<String>, expression: QueryExpression) -> Self {
        self.queries.insert(name.into(), expression);
        self
    }

    /// Builder: name the set.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Evaluate every expression; any missing value is an error.
    pub fn evaluate(&self, message: &Message) -> Result<BTreeMap<String, String>> {
        let mut data = BTreeMap::new();
        for (name, expression) in &self.queries {
            let value = expression.evaluate(message).ok_or_else(|| {
                TetherError::InvalidInstanceKey(format!(
                    "query '{name}' selected no value from message '{}'",
                    message.resolved_action()
                ))
            })?;
            data.insert(name.clone(), value);
        }
        Ok(data)
    }
}

/// Action filter plus the query sets that produce keys for matching messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationQuery {
    /// Exact action to match; `None` matches every message.
    pub where_action: Option<String>,
    /// Primary query set.
    pub select: MessageQuerySet,
    /// Additional query sets.
    pub select_additional: Vec<MessageQuerySet>,
}

impl CorrelationQuery {
    /// Query matching the given action.
    pub fn for_action(action: impl Into<String>, select: MessageQuerySet) -> Self {
        Self {
            where_action: Some(action.into()),
            select,
            select_additional: Vec::new(),
        }
    }

    /// Builder: add an additional query set.
    pub fn with_additional(mut self, set: MessageQuerySet) -> Self {
        self.select_additional.push(set);
        self
    }

    /// Whether the action filter accepts the message.
    pub fn matches(&self, message: &Message) -> bool {
        match &self.where_action {
            None => true,
            Some(action) => action == message.resolved_action(),
        }
    }
}

/// Add an empty-action twin for each action-filtered reply query.
///
/// Older peers send replies without an action header; the twin lets those
/// replies match the same query sets.
pub fn reply_correlation_queries(queries: &[CorrelationQuery]) -> Vec<CorrelationQuery> {
    let mut result = Vec::with_capacity(queries.len() * 2);
    for query in queries {
        result.push(query.clone());
        if query.where_action.as_deref().is_some_and(|a| !a.is_empty()) {
            result.push(CorrelationQuery {
                where_action: Some(String::new()),
                ..query.clone()
            });
        }
    }
    result
}

/// Unordered comparison of two query collections.
pub fn queries_equivalent(a: &[CorrelationQuery], b: &[CorrelationQuery]) -> bool {
    a.len() == b.len() && a.iter().all(|q| b.contains(q)) && b.iter().all(|q| a.contains(q))
}

/// Queries registered on an endpoint, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationQuerySet {
    queries: Vec<CorrelationQuery>,
}

impl CorrelationQuerySet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query; returns `false` if an identical one was already present.
    pub fn add(&mut self, query: CorrelationQuery) -> bool {
        if self.queries.contains(&query) {
            debug!(
                action = query.where_action.as_deref().unwrap_or("*"),
                "Duplicate correlation query ignored"
            );
            return false;
        }
        self.queries.push(query);
        true
    }

    /// The registered queries.
    pub fn as_slice(&self) -> &[CorrelationQuery] {
        &self.queries
    }
}

impl FromIterator<CorrelationQuery> for CorrelationQuerySet {
    fn from_iter<I: IntoIterator<Item = CorrelationQuery>>(iter: I) -> Self {
        let mut set = Self::new();
        for query in iter {
            set.add(query);
        }
        set
    }
}

/// Keys computed for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculatedKeys {
    /// Primary key; its metadata merges every selected value.
    pub key: InstanceKey,
    /// One key per additional query set.
    pub additional: Vec<InstanceKey>,
}

/// Computes instance keys for messages within one correlation scope.
#[derive(Debug, Clone)]
pub struct CorrelationKeyCalculator {
    scope_name: String,
    queries: CorrelationQuerySet,
}

impl CorrelationKeyCalculator {
    /// Calculator over the given queries.
    pub fn new(scope_name: impl Into<String>, queries: impl IntoIterator<Item = CorrelationQuery>) -> Self {
        Self {
            scope_name: scope_name.into(),
            queries: queries.into_iter().collect(),
        }
    }

    /// Scope name mixed into every key.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Queries used by this calculator.
    pub fn queries(&self) -> &[CorrelationQuery] {
        self.queries.as_slice()
    }

    /// Calculator for replies: action-filtered queries also match replies
    /// that arrive without an action.
    pub fn for_reply(&self) -> Self {
        Self {
            scope_name: self.scope_name.clone(),
            queries: reply_correlation_queries(self.queries.as_slice())
                .into_iter()
                .collect(),
        }
    }

    /// Compute keys for a message.
    ///
    /// Returns `Ok(None)` when no query's action filter matches.
    pub fn calculate(&self, message: &Message) -> Result<Option<CalculatedKeys>> {
        let Some(query) = self.queries.as_slice().iter().find(|q| q.matches(message)) else {
            return Ok(None);
        };

        let select_data = query.select.evaluate(message)?;
        let primary = InstanceKey::from_key_data(&self.scope_name, &select_data)?;

        let mut merged: BTreeMap<String, InstanceValue> = BTreeMap::new();
        let mut additional = Vec::with_capacity(query.select_additional.len());
        for (index, set) in query.select_additional.iter().enumerate() {
            let data = set.evaluate(message)?;
            let scope = match &set.name {
                Some(name) => format!("{}/{}", self.scope_name, name),
                None => format!("{}/{}", self.scope_name, index),
            };
            let key = InstanceKey::from_key_data(&scope, &data)?;
            merged.extend(key.metadata().clone());
            additional.push(key);
        }

        Ok(Some(CalculatedKeys {
            key: primary.merged_with(&merged),
            additional,
        }))
    }
}
