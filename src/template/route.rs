//! Route expressions.
//!
//! An action route is a string that may embed references resolved at dispatch
//! time: `state(machine)` (current state of a machine of the same instance),
//! `workspace(key)` (a workspace value) and `config(key)` (a host setting or
//! environment variable). Routes are parsed once when the template loads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RouteError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteSegment {
    Literal(String),
    State(String),
    Workspace(String),
    Config(String),
}

/// A parsed route. Serializes as its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteExpr {
    segments: Vec<RouteSegment>,
}

const REFERENCES: [(&str, fn(String) -> RouteSegment); 3] = [
    ("state(", RouteSegment::State),
    ("workspace(", RouteSegment::Workspace),
    ("config(", RouteSegment::Config),
];

impl RouteExpr {
    pub fn parse(text: &str) -> Result<Self, RouteError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        'scan: while !rest.is_empty() {
            for (prefix, make) in REFERENCES {
                if rest.starts_with(prefix) {
                    let body = &rest[prefix.len()..];
                    let Some(close) = body.find(')') else {
                        return Err(RouteError::Malformed(text.to_string()));
                    };
                    let key = body[..close].trim();
                    if key.is_empty() || key.contains('(') {
                        return Err(RouteError::Malformed(text.to_string()));
                    }
                    if !literal.is_empty() {
                        segments.push(RouteSegment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(make(key.to_string()));
                    rest = &body[close + 1..];
                    continue 'scan;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                literal.push(c);
            }
            rest = chars.as_str();
        }
        if !literal.is_empty() {
            segments.push(RouteSegment::Literal(literal));
        }
        Ok(Self { segments })
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![RouteSegment::Literal(text.into())],
        }
    }

    pub fn segments(&self) -> &[RouteSegment] {
        &self.segments
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, RouteSegment::Literal(_)))
    }

    /// Canonical text with references unexpanded; what workers are asked to support.
    pub fn pattern(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                RouteSegment::Literal(text) => out.push_str(text),
                RouteSegment::State(m) => {
                    out.push_str("state(");
                    out.push_str(m);
                    out.push(')');
                }
                RouteSegment::Workspace(k) => {
                    out.push_str("workspace(");
                    out.push_str(k);
                    out.push(')');
                }
                RouteSegment::Config(k) => {
                    out.push_str("config(");
                    out.push_str(k);
                    out.push(')');
                }
            }
        }
        out
    }

    /// Expand every reference. A reference that fails to resolve contributes
    /// an empty segment and its error is reported alongside the route.
    pub async fn evaluate(&self, ctx: &dyn RouteContext) -> RouteEvaluation {
        let mut route = String::new();
        let mut errors = Vec::new();
        for segment in &self.segments {
            let value = match segment {
                RouteSegment::Literal(text) => Ok(text.clone()),
                RouteSegment::State(machine) => ctx.machine_state(machine).await,
                RouteSegment::Workspace(key) => ctx.workspace_value(key).await,
                RouteSegment::Config(key) => ctx.config_value(key),
            };
            match value {
                Ok(v) => route.push_str(&v),
                Err(e) => errors.push(e),
            }
        }
        RouteEvaluation { route, errors }
    }
}

impl fmt::Display for RouteExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern())
    }
}

impl TryFrom<String> for RouteExpr {
    type Error = RouteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RouteExpr> for String {
    fn from(value: RouteExpr) -> Self {
        value.pattern()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEvaluation {
    pub route: String,
    pub errors: Vec<RouteError>,
}

/// Values available to route references at dispatch time.
#[async_trait::async_trait]
pub trait RouteContext: Send + Sync {
    async fn machine_state(&self, machine: &str) -> Result<String, RouteError>;

    async fn workspace_value(&self, key: &str) -> Result<String, RouteError>;

    fn config_value(&self, key: &str) -> Result<String, RouteError>;
}
