//! Server-side function registry
//!
//! A [`Definition`] maps function names to the user-supplied `get` and `set`
//! callables. `get` functions produce a value plus the invalidation tags it
//! depends on (and optionally calls to prefetch); `set` functions produce a
//! reply plus the tags they invalidate.

use anyhow::Context;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Boxed future returned by a registered function
pub type FnFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A call the engine should materialize ahead of time
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    /// Target function; `None` means the function that produced this result
    pub name: Option<String>,
    pub args: Vec<Value>,
}

/// Result of a `get` function
#[derive(Debug, Clone, PartialEq)]
pub struct GetReturn {
    /// Value pushed to subscribers
    pub value: Value,
    /// Tags this value depends on
    pub tags: Vec<String>,
    /// Calls to prefetch into the cache
    pub prepare: Vec<Prepared>,
}

impl GetReturn {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            tags: Vec::new(),
            prepare: Vec::new(),
        }
    }

    /// Declare a dependency tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Prefetch the same function with other arguments
    pub fn prepare(mut self, args: Vec<Value>) -> Self {
        self.prepare.push(Prepared { name: None, args });
        self
    }

    /// Prefetch another function
    pub fn prepare_call(mut self, name: impl Into<String>, args: Vec<Value>) -> Self {
        self.prepare.push(Prepared {
            name: Some(name.into()),
            args,
        });
        self
    }
}

/// Result of a `set` function
#[derive(Debug, Clone, PartialEq)]
pub struct SetReturn {
    /// Value replied to the caller
    pub value: Value,
    /// Tags whose cached entries are now out of date
    pub invalidates: Vec<String>,
}

impl SetReturn {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            invalidates: Vec::new(),
        }
    }

    pub fn invalidate(mut self, tag: impl Into<String>) -> Self {
        self.invalidates.push(tag.into());
        self
    }
}

/// A `get` function
pub trait GetFunction: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>) -> FnFuture<GetReturn>;
}

impl<F, Fut> GetFunction for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<GetReturn>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> FnFuture<GetReturn> {
        Box::pin(self(args))
    }
}

/// A `set` function
pub trait SetFunction: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>) -> FnFuture<SetReturn>;
}

impl<F, Fut> SetFunction for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<SetReturn>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> FnFuture<SetReturn> {
        Box::pin(self(args))
    }
}

/// Named `get` and `set` functions served by an engine
#[derive(Default, Clone)]
pub struct Definition {
    get: HashMap<String, Arc<dyn GetFunction>>,
    set: HashMap<String, Arc<dyn SetFunction>>,
}

impl Definition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `get` function, replacing any previous one of that name
    pub fn get<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<GetReturn>> + Send + 'static,
    {
        self.get.insert(name.into(), Arc::new(f));
        self
    }

    /// Register a `set` function, replacing any previous one of that name
    pub fn set<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<SetReturn>> + Send + 'static,
    {
        self.set.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get_fn(&self, name: &str) -> Option<Arc<dyn GetFunction>> {
        self.get.get(name).cloned()
    }

    pub fn set_fn(&self, name: &str) -> Option<Arc<dyn SetFunction>> {
        self.set.get(name).cloned()
    }

    pub fn get_names(&self) -> impl Iterator<Item = &str> {
        self.get.keys().map(String::as_str)
    }

    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.set.keys().map(String::as_str)
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut get: Vec<_> = self.get_names().collect();
        let mut set: Vec<_> = self.set_names().collect();
        get.sort_unstable();
        set.sort_unstable();
        f.debug_struct("Definition")
            .field("get", &get)
            .field("set", &set)
            .finish()
    }
}

/// Decode the argument at `index`
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<T> {
    let raw = args
        .get(index)
        .with_context(|| format!("missing argument {index}"))?;
    serde_json::from_value(raw.clone()).with_context(|| format!("invalid argument {index}"))
}
