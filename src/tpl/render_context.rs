use crate::Result;
use crate::data::serializer;
use crate::data::value::{ToValue, Value};
use crate::error::TplError;
use crate::tpl::ast::{PathSegment, VarPath};
use indexmap::IndexMap;
use serde::Serialize;

/// How a reference to a missing variable is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Undefined {
    /// Missing variables and keys are `NotFound` errors.
    #[default]
    Strict,
    /// Missing variables and keys resolve to nil.
    Lenient,
}

/// Per-render settings carried by a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub undefined: Undefined,
    /// Upper bound on loop iterations over the whole render.
    pub max_iterations: Option<usize>,
}

impl RenderOptions {
    pub fn undefined(mut self, undefined: Undefined) -> Self {
        self.undefined = undefined;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }
}

static NULL: Value = Value::Null;

/// Variable bindings for one render: a stack of scopes, outermost (global) first.
#[derive(Debug, Clone)]
pub struct Context {
    scopes: Vec<IndexMap<String, Value>>,
    options: RenderOptions,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(RenderOptions::default())
    }

    pub fn with_options(options: RenderOptions) -> Self {
        Self {
            scopes: vec![IndexMap::new()],
            options,
        }
    }

    /// Builds a context whose global scope is the entries of `root`, which must be a map.
    pub fn from_value(root: Value) -> Result<Self> {
        match root {
            Value::Map(map) => Ok(Self {
                scopes: vec![map],
                options: RenderOptions::default(),
            }),
            other => Err(TplError::type_mismatch(format!(
                "context data must be a map, got {}",
                other.type_name()
            ))),
        }
    }

    /// Serializes `data` and uses it as the global scope.
    pub fn from_serialize<T: ?Sized + Serialize>(data: &T) -> Result<Self> {
        Self::from_value(serializer::to_value(data)?)
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RenderOptions) {
        self.options = options;
    }

    /// Number of live scopes, the global one included.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Binds `value` at `path` in the global scope, creating intermediate maps as needed.
    pub fn set(&mut self, path: &str, value: impl ToValue) -> Result<()> {
        let var = VarPath::parse(path)?;
        let global = &mut self.scopes[0];
        let mut current = global.entry(var.root.clone()).or_insert(Value::Null);
        for segment in &var.segments {
            current = slot_mut(current, segment, &var)?;
        }
        *current = value.to_value();
        Ok(())
    }

    /// Binds `name` in the innermost live scope.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    /// Resolves a path such as `user.tags[0]`.
    pub fn get(&self, path: &str) -> Result<&Value> {
        self.lookup(&VarPath::parse(path)?)
    }

    /// Resolves `path`: the root name against the scopes innermost first, every later
    /// segment against the value resolved so far only.
    pub fn lookup(&self, path: &VarPath) -> Result<&Value> {
        let Some(mut current) = self.find_in_scopes(&path.root) else {
            return self.missing(&VarPath::new(path.root.clone()));
        };

        for (i, segment) in path.segments.iter().enumerate() {
            match resolve_segment(current, segment) {
                Ok(Some(v)) => current = v,
                Ok(None) => {
                    let partial = VarPath {
                        root: path.root.clone(),
                        segments: path.segments[..=i].to_vec(),
                    };
                    return self.missing(&partial);
                }
                Err(message) => {
                    return Err(TplError::type_mismatch(format!("`{}`: {}", path, message)));
                }
            }
        }
        Ok(current)
    }

    /// Runs `f` inside a fresh innermost scope holding `bindings`.
    ///
    /// The scope is popped whether `f` succeeds or fails.
    pub fn with_scope<R>(
        &mut self,
        bindings: impl IntoIterator<Item = (String, Value)>,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.scopes.push(bindings.into_iter().collect());
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn missing(&self, path: &VarPath) -> Result<&Value> {
        match self.options.undefined {
            Undefined::Strict => Err(TplError::not_found(path.to_string())),
            Undefined::Lenient => Ok(&NULL),
        }
    }

    fn find_in_scopes(&self, key: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key))
    }
}

/// `Ok(None)` means the key or index is absent; `Err` means `current` cannot be indexed that way.
fn resolve_segment<'v>(
    current: &'v Value,
    segment: &PathSegment,
) -> std::result::Result<Option<&'v Value>, String> {
    match (current, segment) {
        (Value::Map(m), PathSegment::Key(k)) => Ok(m.get(k)),
        (Value::Map(m), PathSegment::Index(i)) => Ok(m.get(&i.to_string())),
        (Value::List(l), PathSegment::Index(i)) => Ok(list_index(*i, l.len()).map(|idx| &l[idx])),
        (Value::List(l), PathSegment::Key(k)) => match k.parse::<i64>() {
            Ok(i) => Ok(list_index(i, l.len()).map(|idx| &l[idx])),
            Err(_) => Err(format!("cannot look up key `{}` on a list", k)),
        },
        (other, PathSegment::Key(k)) => Err(format!(
            "cannot look up key `{}` on a {}",
            k,
            other.type_name()
        )),
        (other, PathSegment::Index(i)) => Err(format!(
            "cannot index a {} with [{}]",
            other.type_name(),
            i
        )),
    }
}

fn slot_mut<'v>(
    current: &'v mut Value,
    segment: &PathSegment,
    path: &VarPath,
) -> Result<&'v mut Value> {
    if matches!(current, Value::Null) && matches!(segment, PathSegment::Key(_)) {
        *current = Value::Map(IndexMap::new());
    }
    match (current, segment) {
        (Value::Map(m), PathSegment::Key(k)) => Ok(m.entry(k.clone()).or_insert(Value::Null)),
        (Value::Map(m), PathSegment::Index(i)) => {
            Ok(m.entry(i.to_string()).or_insert(Value::Null))
        }
        (Value::List(l), PathSegment::Index(i)) => match list_index(*i, l.len()) {
            Some(idx) => Ok(&mut l[idx]),
            None => Err(TplError::not_found(path.to_string())),
        },
        (other, _) => Err(TplError::type_mismatch(format!(
            "`{}`: cannot assign into a {}",
            path,
            other.type_name()
        ))),
    }
}

/// Negative indexes count from the end.
fn list_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}
