//! Scopes for the NCL Compiler
//!
//! A `DataContext` is the host-supplied root mapping. `Scope` frames chain on
//! top of it: loop iterations push child frames, component instances push
//! isolated frames that remember their caller so slot content can be
//! evaluated where it was written.

use crate::static_eval::Bindings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Root data supplied per page render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataContext {
    values: Map<String, Value>,
}

impl DataContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a JSON object; `null` is treated as an empty context.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            Value::Null => Some(Self::default()),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

impl From<Map<String, Value>> for DataContext {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl Bindings for DataContext {
    fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// One lexical frame.
#[derive(Debug)]
pub struct Scope<'a> {
    data: &'a DataContext,
    locals: HashMap<String, Value>,
    parent: Option<&'a Scope<'a>>,
    caller: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    pub fn root(data: &'a DataContext) -> Self {
        Scope {
            data,
            locals: HashMap::new(),
            parent: None,
            caller: None,
        }
    }

    /// A frame that sees every binding of `self` (loop iterations).
    pub fn child(&'a self) -> Scope<'a> {
        Scope {
            data: self.data,
            locals: HashMap::new(),
            parent: Some(self),
            caller: None,
        }
    }

    /// A frame that sees only its own bindings and root data (component
    /// instances). `self` becomes the caller.
    pub fn isolated(&'a self) -> Scope<'a> {
        Scope {
            data: self.data,
            locals: HashMap::new(),
            parent: None,
            caller: Some(self),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    /// Bound in this frame or a visible ancestor, ignoring root data.
    pub fn lookup_local(&self, name: &str) -> Option<&Value> {
        self.locals
            .get(name)
            .or_else(|| self.parent.and_then(|p| p.lookup_local(name)))
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.lookup_local(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.lookup_local(name)
            .cloned()
            .or_else(|| self.data.get(name).cloned())
    }

    /// The frame slot content is evaluated in.
    pub fn caller(&self) -> Option<&'a Scope<'a>> {
        self.caller.or_else(|| self.parent.and_then(|p| p.caller()))
    }

    pub fn data(&self) -> &'a DataContext {
        self.data
    }
}

impl Bindings for Scope<'_> {
    fn get(&self, name: &str) -> Option<Value> {
        self.lookup(name)
    }
}

/// Only the locally bound names; root data is left for the interpolation stage.
pub struct LocalBindings<'s, 'a>(pub &'s Scope<'a>);

impl Bindings for LocalBindings<'_, '_> {
    fn get(&self, name: &str) -> Option<Value> {
        self.0.lookup_local(name).cloned()
    }
}
