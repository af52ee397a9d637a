// src/engine/line.rs

//! A deliberately tiny line-oriented interpreter.
//!
//! This is the engine hosted by `replvisor serve-backend`. It exists so the
//! supervisor has something real to drive; the supervisor itself never looks
//! inside it.
//!
//! ```text
//! name = some text      assign, evaluates to the assigned text
//! name                  look a variable up
//! name.upper            text members: len, lower, trim, upper
//! print some text       write a line of output
//! vars                  print every variable in the scope
//! sleep 500             wait (interruptible)
//! raise message         raise a RuntimeError
//! exit [code]           end the backend process
//! crash                 abort the backend process
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{RemoteError, ScopeHandle};

const TEXT_MEMBERS: [&str; 4] = ["len", "lower", "trim", "upper"];

/// What the host has to do after a line was evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Value(Option<String>),
    Output(String),
    Sleep(Duration),
    Exit(i32),
    Crash,
}

#[derive(Debug)]
pub struct LineEngine {
    scopes: HashMap<ScopeHandle, BTreeMap<String, String>>,
    default_scope: ScopeHandle,
    next_scope: u64,
}

impl Default for LineEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEngine {
    pub fn new() -> Self {
        let default_scope = ScopeHandle(1);
        let mut scopes = HashMap::new();
        scopes.insert(default_scope, BTreeMap::new());
        Self {
            scopes,
            default_scope,
            next_scope: 2,
        }
    }

    pub fn default_scope(&self) -> ScopeHandle {
        self.default_scope
    }

    pub fn create_scope(&mut self) -> ScopeHandle {
        let scope = ScopeHandle(self.next_scope);
        self.next_scope += 1;
        self.scopes.insert(scope, BTreeMap::new());
        scope
    }

    pub fn bind(&mut self, scope: ScopeHandle, name: &str, value: impl Into<String>) -> Result<(), RemoteError> {
        self.scope_mut(scope)?.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn evaluate(&mut self, scope: ScopeHandle, source: &str) -> Result<Action, RemoteError> {
        let source = source.trim();
        if source.is_empty() {
            return Ok(Action::Value(None));
        }

        let (head, rest) = match source.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (source, ""),
        };

        match head {
            "print" => Ok(Action::Output(format!("{rest}\n"))),
            "vars" if rest.is_empty() => {
                let text = self
                    .scope(scope)?
                    .iter()
                    .map(|(name, value)| format!("{name} = {value}\n"))
                    .collect();
                Ok(Action::Output(text))
            }
            "sleep" => rest
                .parse::<u64>()
                .map(|ms| Action::Sleep(Duration::from_millis(ms)))
                .map_err(|_| RemoteError::runtime("sleep expects a number of milliseconds")),
            "raise" => Err(RemoteError::runtime(if rest.is_empty() {
                "unhandled error"
            } else {
                rest
            })),
            "exit" if rest.is_empty() => Ok(Action::Exit(0)),
            "exit" => rest
                .parse::<i32>()
                .map(Action::Exit)
                .map_err(|_| RemoteError::runtime("exit expects an integer status")),
            "crash" if rest.is_empty() => Ok(Action::Crash),
            _ => match source.split_once('=') {
                Some((name, value)) => {
                    let name = name.trim();
                    if !is_identifier(name) {
                        return Err(RemoteError::new(
                            "SyntaxError",
                            format!("cannot assign to '{name}'"),
                        ));
                    }
                    let value = value.trim().to_string();
                    self.bind(scope, name, value.clone())?;
                    Ok(Action::Value(Some(value)))
                }
                None => self.expression(scope, source).map(|v| Action::Value(Some(v))),
            },
        }
    }

    /// Member names of whatever `expression` evaluates to in the default
    /// scope. The empty expression names the scope itself.
    pub fn member_names(&self, expression: &str) -> Result<Vec<String>, RemoteError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(self.scope(self.default_scope)?.keys().cloned().collect());
        }
        self.expression(self.default_scope, expression)?;
        Ok(TEXT_MEMBERS.iter().map(|m| m.to_string()).collect())
    }

    fn expression(&self, scope: ScopeHandle, expression: &str) -> Result<String, RemoteError> {
        let (name, member) = match expression.split_once('.') {
            Some((name, member)) => (name.trim(), Some(member.trim())),
            None => (expression.trim(), None),
        };

        if !is_identifier(name) {
            return Err(RemoteError::new(
                "SyntaxError",
                format!("invalid expression '{expression}'"),
            ));
        }

        let value = self
            .scope(scope)?
            .get(name)
            .ok_or_else(|| RemoteError::name_error(name))?;

        match member {
            None => Ok(value.clone()),
            Some("len") => Ok(value.chars().count().to_string()),
            Some("lower") => Ok(value.to_lowercase()),
            Some("trim") => Ok(value.trim().to_string()),
            Some("upper") => Ok(value.to_uppercase()),
            Some(other) => Err(RemoteError::new(
                "AttributeError",
                format!("text has no member '{other}'"),
            )),
        }
    }

    fn scope(&self, scope: ScopeHandle) -> Result<&BTreeMap<String, String>, RemoteError> {
        self.scopes.get(&scope).ok_or_else(|| unknown_scope(scope))
    }

    fn scope_mut(&mut self, scope: ScopeHandle) -> Result<&mut BTreeMap<String, String>, RemoteError> {
        self.scopes.get_mut(&scope).ok_or_else(|| unknown_scope(scope))
    }
}

fn unknown_scope(scope: ScopeHandle) -> RemoteError {
    RemoteError::new("ScopeError", format!("unknown scope {}", scope.0))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
