//! Sandbox value model: an arena heap of objects addressed by handles.
//!
//! Object identity is handle identity, so "the same exports object" means the
//! same `ObjectHandle`. Functions, arrays, errors and mock stand-ins are all
//! heap objects and can carry ordinary properties.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::FunctionDef;
use crate::stack_trace::RawFrame;

/// Maximum prototype chain depth walked by property lookup.
const MAX_PROTOTYPE_CHAIN_DEPTH: u32 = 256;

/// Marker property present (and `true`) on every mock function.
pub const MOCK_FUNCTION_MARKER: &str = "_isMockFunction";

/// Opaque handle referencing an object on the sandbox heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

/// Handle into the interpreter's environment arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvHandle(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Object(ObjectHandle),
}

impl JsValue {
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, Self::Object(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Str(s) => !s.is_empty(),
            Self::Object(_) => true,
        }
    }

    /// `===`; objects compare by handle.
    pub fn strict_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            _ => self == other,
        }
    }

    /// `==` for the primitive combinations the sandbox supports.
    pub fn loose_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined | Self::Null, Self::Undefined | Self::Null) => true,
            (Self::Number(a), Self::Str(b)) | (Self::Str(b), Self::Number(a)) => {
                b.trim().parse::<f64>().is_ok_and(|parsed| parsed == *a)
            }
            (Self::Bool(a), other) | (other, Self::Bool(a)) if !matches!(other, Self::Bool(_)) => {
                Self::Number(if *a { 1.0 } else { 0.0 }).loose_equals(other)
            }
            _ => self.strict_equals(other),
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::Str(s) if s.trim().is_empty() => 0.0,
            Self::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
            Self::Object(_) => f64::NAN,
        }
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Str(s) => write!(f, "{s}"),
            Self::Object(h) => write!(f, "[object#{}]", h.0),
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Host-implemented operations reachable from module code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOp {
    Require,
    RequireActual,
    Mock,
    Unmock,
    EnableAutomock,
    DisableAutomock,
    ResetModuleRegistry,
    CreateMockFn,
    GenMockFromModule,
}

impl HostOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Require => "require",
            Self::RequireActual => "requireActual",
            Self::Mock => "mock",
            Self::Unmock => "unmock",
            Self::EnableAutomock => "enableAutomock",
            Self::DisableAutomock => "disableAutomock",
            Self::ResetModuleRegistry => "resetModuleRegistry",
            Self::CreateMockFn => "fn",
            Self::GenMockFromModule => "genMockFromModule",
        }
    }
}

/// Error constructors known to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    Error,
    TypeError,
    ReferenceError,
    RangeError,
}

impl ErrorKind {
    pub const ALL: [Self; 4] = [
        Self::Error,
        Self::TypeError,
        Self::ReferenceError,
        Self::RangeError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::ReferenceError => "ReferenceError",
            Self::RangeError => "RangeError",
        }
    }
}

/// Built-ins implemented by the interpreter itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    ErrorCtor(ErrorKind),
    MockReturnValue(ObjectHandle),
    MockImplementation(ObjectHandle),
    MockClear(ObjectHandle),
}

/// Recorded interaction state of a trackable stand-in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MockState {
    pub calls: Vec<Vec<JsValue>>,
    pub results: Vec<JsValue>,
    pub instances: Vec<JsValue>,
    pub return_value: Option<JsValue>,
    pub implementation: Option<JsValue>,
}

impl MockState {
    pub fn clear(&mut self) {
        self.calls.clear();
        self.results.clear();
        self.instances.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub def: Arc<FunctionDef>,
    pub env: EnvHandle,
    /// Script label used for stack frames of this function's body.
    pub script: Arc<str>,
    pub is_class_constructor: bool,
}

#[derive(Debug, Clone)]
pub enum Callable {
    Script(ScriptFunction),
    Builtin(Builtin),
    Host { op: HostOp, module_id: Arc<str> },
    Mock(MockState),
}

#[derive(Debug, Clone)]
pub enum ObjectKind {
    Plain,
    Array(Vec<JsValue>),
    /// Error instance with the frames captured at construction.
    Error { frames: Vec<RawFrame> },
    Function { name: String, callable: Callable },
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    pub kind: ObjectKind,
    pub prototype: Option<ObjectHandle>,
    pub properties: BTreeMap<String, JsValue>,
}

impl HeapObject {
    fn new(kind: ObjectKind, prototype: Option<ObjectHandle>) -> Self {
        Self {
            kind,
            prototype,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, ObjectKind::Function { .. })
    }

    pub fn function_name(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Function { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn mock_state(&self) -> Option<&MockState> {
        match &self.kind {
            ObjectKind::Function {
                callable: Callable::Mock(state),
                ..
            } => Some(state),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeapError {
    ObjectNotFound(ObjectHandle),
    PrototypeChainTooDeep { depth: u32, max: u32 },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectNotFound(h) => write!(f, "object#{} not found", h.0),
            Self::PrototypeChainTooDeep { depth, max } => {
                write!(f, "prototype chain depth {depth} exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for HeapError {}

pub type HeapResult<T> = Result<T, HeapError>;

/// Arena of sandbox objects, one per execution context.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn alloc(&mut self, kind: ObjectKind, prototype: Option<ObjectHandle>) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects.push(HeapObject::new(kind, prototype));
        handle
    }

    /// Allocate with an initial set of own properties.
    pub fn alloc_with(
        &mut self,
        kind: ObjectKind,
        prototype: Option<ObjectHandle>,
        entries: impl IntoIterator<Item = (String, JsValue)>,
    ) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        let mut object = HeapObject::new(kind, prototype);
        object.properties.extend(entries);
        self.objects.push(object);
        handle
    }

    pub fn alloc_plain(&mut self) -> ObjectHandle {
        self.alloc(ObjectKind::Plain, None)
    }

    pub fn alloc_array(&mut self, items: Vec<JsValue>) -> ObjectHandle {
        self.alloc(ObjectKind::Array(items), None)
    }

    pub fn alloc_function(&mut self, name: impl Into<String>, callable: Callable) -> ObjectHandle {
        self.alloc(
            ObjectKind::Function {
                name: name.into(),
                callable,
            },
            None,
        )
    }

    /// Allocate a mock stand-in with its script-visible control methods.
    pub fn alloc_mock_function(&mut self, name: impl Into<String>) -> ObjectHandle {
        let handle = self.alloc_function(name, Callable::Mock(MockState::default()));
        self.attach_mock_controls(handle);
        handle
    }

    /// Turn an existing object into a mock stand-in, keeping its identity
    /// and own properties.
    pub fn convert_to_mock_function(
        &mut self,
        handle: ObjectHandle,
        name: impl Into<String>,
    ) -> HeapResult<()> {
        self.get_mut(handle)?.kind = ObjectKind::Function {
            name: name.into(),
            callable: Callable::Mock(MockState::default()),
        };
        self.attach_mock_controls(handle);
        Ok(())
    }

    fn attach_mock_controls(&mut self, handle: ObjectHandle) {
        let return_value =
            self.alloc_function("mockReturnValue", Callable::Builtin(Builtin::MockReturnValue(handle)));
        let implementation = self.alloc_function(
            "mockImplementation",
            Callable::Builtin(Builtin::MockImplementation(handle)),
        );
        let clear = self.alloc_function("mockClear", Callable::Builtin(Builtin::MockClear(handle)));
        if let Some(object) = self.objects.get_mut(handle.0 as usize) {
            object
                .properties
                .insert(MOCK_FUNCTION_MARKER.to_string(), JsValue::Bool(true));
            object
                .properties
                .insert("mockReturnValue".to_string(), JsValue::Object(return_value));
            object
                .properties
                .insert("mockImplementation".to_string(), JsValue::Object(implementation));
            object
                .properties
                .insert("mockClear".to_string(), JsValue::Object(clear));
        }
    }

    pub fn object_from_entries(&mut self, entries: Vec<(String, JsValue)>) -> ObjectHandle {
        self.alloc_with(ObjectKind::Plain, None, entries)
    }

    pub fn get(&self, handle: ObjectHandle) -> HeapResult<&HeapObject> {
        self.objects
            .get(handle.0 as usize)
            .ok_or(HeapError::ObjectNotFound(handle))
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> HeapResult<&mut HeapObject> {
        self.objects
            .get_mut(handle.0 as usize)
            .ok_or(HeapError::ObjectNotFound(handle))
    }

    pub fn is_callable(&self, value: &JsValue) -> bool {
        value
            .as_object()
            .and_then(|h| self.get(h).ok())
            .is_some_and(HeapObject::is_callable)
    }

    pub fn is_mock_function(&self, value: &JsValue) -> bool {
        value
            .as_object()
            .and_then(|h| self.get(h).ok())
            .and_then(HeapObject::mock_state)
            .is_some()
    }

    pub fn type_of(&self, value: &JsValue) -> &'static str {
        match value {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::Str(_) => "string",
            JsValue::Object(_) if self.is_callable(value) => "function",
            JsValue::Object(_) => "object",
        }
    }

    /// `[[Get]]` walking the prototype chain, with array/function intrinsics.
    pub fn get_property(&self, handle: ObjectHandle, key: &str) -> HeapResult<JsValue> {
        let mut current = Some(handle);
        let mut depth = 0u32;
        let mut visited = BTreeSet::new();

        while let Some(h) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH || !visited.insert(h) {
                return Err(HeapError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            let object = self.get(h)?;
            if let Some(value) = object.properties.get(key) {
                return Ok(value.clone());
            }
            match &object.kind {
                ObjectKind::Array(items) => {
                    if key == "length" {
                        return Ok(JsValue::Number(items.len() as f64));
                    }
                    if let Ok(index) = key.parse::<usize>() {
                        return Ok(items.get(index).cloned().unwrap_or(JsValue::Undefined));
                    }
                }
                ObjectKind::Function { name, .. } if key == "name" => {
                    return Ok(JsValue::Str(name.clone()));
                }
                _ => {}
            }
            current = object.prototype;
            depth += 1;
        }
        Ok(JsValue::Undefined)
    }

    pub fn set_property(
        &mut self,
        handle: ObjectHandle,
        key: impl Into<String>,
        value: JsValue,
    ) -> HeapResult<()> {
        let key = key.into();
        let object = self.get_mut(handle)?;
        if let ObjectKind::Array(items) = &mut object.kind
            && let Ok(index) = key.parse::<usize>()
        {
            if index >= items.len() {
                items.resize(index + 1, JsValue::Undefined);
            }
            items[index] = value;
            return Ok(());
        }
        object.properties.insert(key, value);
        Ok(())
    }

    pub fn own_keys(&self, handle: ObjectHandle) -> HeapResult<Vec<String>> {
        Ok(self.get(handle)?.properties.keys().cloned().collect())
    }

    pub fn array_items(&self, handle: ObjectHandle) -> HeapResult<Option<&[JsValue]>> {
        Ok(match &self.get(handle)?.kind {
            ObjectKind::Array(items) => Some(items.as_slice()),
            _ => None,
        })
    }

    pub fn mock_state_mut(&mut self, handle: ObjectHandle) -> HeapResult<Option<&mut MockState>> {
        Ok(match &mut self.get_mut(handle)?.kind {
            ObjectKind::Function {
                callable: Callable::Mock(state),
                ..
            } => Some(state),
            _ => None,
        })
    }

    pub fn from_json(&mut self, value: &serde_json::Value) -> JsValue {
        match value {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(*b),
            serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => JsValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                let items = items.iter().map(|item| self.from_json(item)).collect();
                JsValue::Object(self.alloc_array(items))
            }
            serde_json::Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(key, item)| (key.clone(), self.from_json(item)))
                    .collect();
                JsValue::Object(self.object_from_entries(entries))
            }
        }
    }

    /// Snapshot a value as JSON. Functions become `"[Function name]"` and
    /// repeated objects on the current path become `"[Circular]"`.
    pub fn to_json(&self, value: &JsValue) -> serde_json::Value {
        let mut path = BTreeSet::new();
        self.to_json_inner(value, &mut path)
    }

    fn to_json_inner(
        &self,
        value: &JsValue,
        path: &mut BTreeSet<ObjectHandle>,
    ) -> serde_json::Value {
        match value {
            JsValue::Undefined | JsValue::Null => serde_json::Value::Null,
            JsValue::Bool(b) => serde_json::Value::Bool(*b),
            JsValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                serde_json::Value::Number(serde_json::Number::from(*n as i64))
            }
            JsValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            JsValue::Str(s) => serde_json::Value::String(s.clone()),
            JsValue::Object(handle) => {
                let Ok(object) = self.get(*handle) else {
                    return serde_json::Value::Null;
                };
                if !path.insert(*handle) {
                    return serde_json::Value::String("[Circular]".to_string());
                }
                let out = match &object.kind {
                    ObjectKind::Function { name, .. } => {
                        serde_json::Value::String(format!("[Function {name}]"))
                    }
                    ObjectKind::Array(items) => serde_json::Value::Array(
                        items
                            .iter()
                            .map(|item| self.to_json_inner(item, path))
                            .collect(),
                    ),
                    ObjectKind::Plain | ObjectKind::Error { .. } => {
                        let mut map = serde_json::Map::new();
                        for (key, item) in &object.properties {
                            map.insert(key.clone(), self.to_json_inner(item, path));
                        }
                        serde_json::Value::Object(map)
                    }
                };
                path.remove(handle);
                out
            }
        }
    }
}
