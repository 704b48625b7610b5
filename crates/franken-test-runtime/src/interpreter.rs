//! Tree-walking evaluator for sandboxed module code.
//!
//! One `Sandbox` exists per execution context and owns that context's heap,
//! environments and call stack. Operations that need the module system
//! (`require`, the `mocks` controls) are dispatched to a `Host` supplied by
//! the caller, which receives the sandbox back so it can run nested modules.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{
    BinaryOp, ClassDef, DeclKind, Expr, ExprKind, FunctionBody, FunctionDef, Literal, LogicalOp,
    Position, Program, Statement, UnaryOp,
};
use crate::error::RuntimeError;
use crate::stack_trace::{
    LOADER_SCRIPT_LABEL, PathStyle, RawFrame, StackFrame, StackNormalizer, WrapperLayout,
};
use crate::value::{
    Builtin, Callable, EnvHandle, ErrorKind, Heap, HeapError, HostOp, JsValue, ObjectHandle,
    ObjectKind, ScriptFunction, format_number,
};

/// Nesting limit for script calls.
pub const MAX_CALL_DEPTH: usize = 200;

/// Nesting limit for expression evaluation, calls included.
pub const MAX_EVAL_DEPTH: usize = 1024;

/// Non-local exit from evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// A script-level `throw`; `frames` is the stack at the throw site.
    Throw {
        value: JsValue,
        frames: Vec<RawFrame>,
    },
    /// A host failure travelling through script frames unchanged.
    Host(RuntimeError),
}

impl From<RuntimeError> for Interrupt {
    fn from(error: RuntimeError) -> Self {
        Self::Host(error)
    }
}

impl From<HeapError> for Interrupt {
    fn from(error: HeapError) -> Self {
        Self::Host(RuntimeError::Heap(error))
    }
}

pub type EvalResult<T> = Result<T, Interrupt>;

/// Arguments of a host operation invoked from script code.
#[derive(Debug, Clone)]
pub struct HostCall<'a> {
    pub op: HostOp,
    /// Identity of the module the host function was created for.
    pub module_id: &'a str,
    pub this: JsValue,
    pub args: Vec<JsValue>,
}

pub trait Host {
    fn host_call(&mut self, sandbox: &mut Sandbox, call: HostCall<'_>) -> EvalResult<JsValue>;
}

/// A thrown value rendered for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrowReport {
    pub name: String,
    pub message: String,
    pub stack: String,
    pub frames: Vec<StackFrame>,
}

#[derive(Debug, Clone)]
struct Binding {
    value: JsValue,
    mutable: bool,
}

#[derive(Debug, Clone, Default)]
struct Environment {
    parent: Option<EnvHandle>,
    bindings: BTreeMap<String, Binding>,
    /// Set for non-arrow function scopes; arrows see the enclosing value.
    this_value: Option<JsValue>,
}

#[derive(Debug, Clone)]
struct ActiveFrame {
    function_name: String,
    script: Arc<str>,
    position: Position,
}

enum Flow {
    Normal,
    Return(JsValue),
}

enum Dispatch {
    Script(ScriptFunction),
    Builtin(Builtin),
    Host(HostOp, Arc<str>),
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Plain,
    Method,
    ClassConstructor,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    heap: Heap,
    envs: Vec<Environment>,
    global: EnvHandle,
    frames: Vec<ActiveFrame>,
    eval_depth: usize,
    normalizer: StackNormalizer,
    error_prototypes: BTreeMap<ErrorKind, ObjectHandle>,
    loader_label: Arc<str>,
}

impl Sandbox {
    pub fn new(style: PathStyle) -> Self {
        let mut sandbox = Self {
            heap: Heap::new(),
            envs: vec![Environment::default()],
            global: EnvHandle(0),
            frames: Vec::new(),
            eval_depth: 0,
            normalizer: StackNormalizer::new(style),
            error_prototypes: BTreeMap::new(),
            loader_label: Arc::from(LOADER_SCRIPT_LABEL),
        };
        sandbox.install_globals();
        sandbox
    }

    fn install_globals(&mut self) {
        let mut base = None;
        for kind in ErrorKind::ALL {
            let proto = self.heap.alloc_with(
                ObjectKind::Plain,
                base,
                [
                    ("name".to_string(), JsValue::str(kind.name())),
                    ("message".to_string(), JsValue::str("")),
                ],
            );
            if base.is_none() {
                base = Some(proto);
            }
            let ctor = self.heap.alloc_with(
                ObjectKind::Function {
                    name: kind.name().to_string(),
                    callable: Callable::Builtin(Builtin::ErrorCtor(kind)),
                },
                None,
                [("prototype".to_string(), JsValue::Object(proto))],
            );
            self.error_prototypes.insert(kind, proto);
            self.declare(self.global, kind.name(), JsValue::Object(ctor), false);
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn normalizer(&self) -> &StackNormalizer {
        &self.normalizer
    }

    /// Mark `script` as user code whose frames survive normalization.
    pub fn register_script(&mut self, script: Arc<str>, layout: WrapperLayout) {
        self.normalizer.register_script(script, layout);
    }

    pub fn alloc_host_function(
        &mut self,
        name: impl Into<String>,
        op: HostOp,
        module_id: Arc<str>,
    ) -> ObjectHandle {
        self.heap
            .alloc_function(name, Callable::Host { op, module_id })
    }

    /// Run a parsed program in a fresh scope below the globals and return
    /// the value of its last expression statement.
    pub fn evaluate_program(
        &mut self,
        program: &Program,
        script: Arc<str>,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let env = self.new_env(Some(self.global), None);
        self.frames.push(ActiveFrame {
            function_name: String::new(),
            script,
            position: Position::new(1, 1),
        });
        let result = self.run_program(&program.body, env, host);
        self.frames.pop();
        result
    }

    fn run_program(
        &mut self,
        body: &[Statement],
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        self.hoist_functions(body, env)?;
        let mut last = JsValue::Undefined;
        for statement in body {
            if let Statement::Expression(expr) = statement {
                last = self.eval(expr, env, host)?;
                continue;
            }
            if let Flow::Return(value) = self.exec_statement(statement, env, host)? {
                return Ok(value);
            }
        }
        Ok(last)
    }

    /// Call `function` from the embedder side as a plain call.
    pub fn call_function(
        &mut self,
        function: &JsValue,
        this: JsValue,
        args: Vec<JsValue>,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        if !self.heap.is_callable(function) {
            return Err(RuntimeError::invalid_operation(format!(
                "{} is not a function",
                self.to_display(function)
            ))
            .into());
        }
        let name = self.function_name(function);
        self.call_with_name(function, this, args, name, host)
    }

    /// Call `function` as a method of `receiver`; frames are labelled
    /// `Type.name`.
    pub fn call_method(
        &mut self,
        function: &JsValue,
        receiver: JsValue,
        args: Vec<JsValue>,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        if !self.heap.is_callable(function) {
            return Err(RuntimeError::invalid_operation(format!(
                "{} is not a function",
                self.to_display(function)
            ))
            .into());
        }
        let name = self.method_frame_name(function, &receiver);
        self.call_with_name(function, receiver, args, name, host)
    }

    /// `new function(...args)` from the embedder side.
    pub fn construct(
        &mut self,
        function: &JsValue,
        args: Vec<JsValue>,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let label = self.function_name(function);
        self.construct_value(function, args, &label, host)
    }

    /// Build an error object whose stack is captured from the current frames.
    pub fn create_error(&mut self, kind: ErrorKind, message: &str) -> JsValue {
        let frames = self.capture_frames();
        let normalized = self.normalizer.normalize(&frames, None);
        let stack = self.normalizer.render(kind.name(), message, &normalized);
        let proto = self.error_prototypes.get(&kind).copied();
        let handle = self.heap.alloc_with(
            ObjectKind::Error { frames },
            proto,
            [
                ("message".to_string(), JsValue::str(message)),
                ("stack".to_string(), JsValue::Str(stack)),
            ],
        );
        JsValue::Object(handle)
    }

    pub fn throw_error(&mut self, kind: ErrorKind, message: impl Into<String>) -> Interrupt {
        let value = self.create_error(kind, &message.into());
        Interrupt::Throw {
            value,
            frames: self.capture_frames(),
        }
    }

    /// Render a thrown value. Error objects use their construction frames;
    /// other values use the frames of the throw site.
    pub fn describe_throw(
        &self,
        value: &JsValue,
        throw_frames: &[RawFrame],
        executing: Option<&str>,
    ) -> ThrowReport {
        let (name, message, raw) = match self.error_parts(value) {
            Some(parts) => parts,
            None => (
                "Uncaught".to_string(),
                self.to_display(value),
                throw_frames.to_vec(),
            ),
        };
        let frames = self.normalizer.normalize(&raw, executing);
        let stack = self.normalizer.render(&name, &message, &frames);
        ThrowReport {
            name,
            message,
            stack,
            frames,
        }
    }

    fn error_parts(&self, value: &JsValue) -> Option<(String, String, Vec<RawFrame>)> {
        let handle = value.as_object()?;
        let object = self.heap.get(handle).ok()?;
        let ObjectKind::Error { frames } = &object.kind else {
            return None;
        };
        let name = self
            .heap
            .get_property(handle, "name")
            .map(|v| self.to_display(&v))
            .unwrap_or_else(|_| "Error".to_string());
        let message = self
            .heap
            .get_property(handle, "message")
            .map(|v| self.to_display(&v))
            .unwrap_or_default();
        Some((name, message, frames.clone()))
    }

    pub fn function_name(&self, value: &JsValue) -> String {
        value
            .as_object()
            .and_then(|h| self.heap.get(h).ok())
            .and_then(|object| object.function_name().map(str::to_string))
            .unwrap_or_default()
    }

    /// String conversion used by `+`, error messages and reports.
    pub fn to_display(&self, value: &JsValue) -> String {
        self.to_display_depth(value, 0)
    }

    fn to_display_depth(&self, value: &JsValue, depth: usize) -> String {
        let JsValue::Object(handle) = value else {
            return value.to_string();
        };
        let Ok(object) = self.heap.get(*handle) else {
            return "[object Object]".to_string();
        };
        match &object.kind {
            ObjectKind::Array(_) if depth > 8 => String::new(),
            ObjectKind::Array(items) => items
                .iter()
                .map(|item| match item {
                    JsValue::Undefined | JsValue::Null => String::new(),
                    other => self.to_display_depth(other, depth + 1),
                })
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Error { .. } => {
                let name = self
                    .heap
                    .get_property(*handle, "name")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let message = self
                    .heap
                    .get_property(*handle, "message")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                if message.is_empty() {
                    name
                } else {
                    format!("{name}: {message}")
                }
            }
            ObjectKind::Function { name, .. } => format!("function {name}() {{ [native code] }}"),
            ObjectKind::Plain => "[object Object]".to_string(),
        }
    }

    fn capture_frames(&self) -> Vec<RawFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| RawFrame {
                function_name: frame.function_name.clone(),
                script: frame.script.clone(),
                position: frame.position,
            })
            .collect()
    }

    fn set_position(&mut self, position: Position) {
        if let Some(frame) = self.frames.last_mut() {
            frame.position = position;
        }
    }

    fn current_script(&self) -> Arc<str> {
        self.frames
            .last()
            .map(|frame| frame.script.clone())
            .unwrap_or_else(|| self.loader_label.clone())
    }

    fn new_env(&mut self, parent: Option<EnvHandle>, this_value: Option<JsValue>) -> EnvHandle {
        let handle = EnvHandle(self.envs.len() as u32);
        self.envs.push(Environment {
            parent,
            bindings: BTreeMap::new(),
            this_value,
        });
        handle
    }

    fn declare(&mut self, env: EnvHandle, name: &str, value: JsValue, mutable: bool) {
        if let Some(scope) = self.envs.get_mut(env.0 as usize) {
            scope
                .bindings
                .insert(name.to_string(), Binding { value, mutable });
        }
    }

    fn find_scope(&self, env: EnvHandle, name: &str) -> Option<EnvHandle> {
        let mut current = Some(env);
        while let Some(handle) = current {
            let scope = self.envs.get(handle.0 as usize)?;
            if scope.bindings.contains_key(name) {
                return Some(handle);
            }
            current = scope.parent;
        }
        None
    }

    fn lookup(&mut self, env: EnvHandle, name: &str) -> EvalResult<JsValue> {
        let found = self
            .find_scope(env, name)
            .and_then(|handle| self.envs.get(handle.0 as usize))
            .and_then(|scope| scope.bindings.get(name))
            .map(|binding| binding.value.clone());
        match found {
            Some(value) => Ok(value),
            None => Err(self.throw_error(ErrorKind::ReferenceError, format!("{name} is not defined"))),
        }
    }

    fn assign_binding(&mut self, env: EnvHandle, name: &str, value: JsValue) -> EvalResult<()> {
        let Some(scope) = self.find_scope(env, name) else {
            return Err(self.throw_error(ErrorKind::ReferenceError, format!("{name} is not defined")));
        };
        if let Some(binding) = self
            .envs
            .get_mut(scope.0 as usize)
            .and_then(|scope| scope.bindings.get_mut(name))
            && binding.mutable
        {
            binding.value = value;
            return Ok(());
        }
        Err(self.throw_error(ErrorKind::TypeError, "Assignment to constant variable."))
    }

    fn this_value(&self, env: EnvHandle) -> JsValue {
        let mut current = Some(env);
        while let Some(handle) = current {
            let Some(scope) = self.envs.get(handle.0 as usize) else {
                break;
            };
            if let Some(this) = &scope.this_value {
                return this.clone();
            }
            current = scope.parent;
        }
        JsValue::Undefined
    }

    fn hoist_functions(&mut self, body: &[Statement], env: EnvHandle) -> EvalResult<()> {
        for statement in body {
            match statement {
                Statement::FunctionDecl(def) => {
                    let handle = self.create_function(def.clone(), env, FunctionKind::Plain)?;
                    let name = def.name.clone().unwrap_or_default();
                    self.declare(env, &name, JsValue::Object(handle), true);
                }
                Statement::If {
                    consequent,
                    alternate,
                    ..
                } => {
                    self.hoist_functions(consequent, env)?;
                    if let Some(alternate) = alternate {
                        self.hoist_functions(alternate, env)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn exec_statements(
        &mut self,
        body: &[Statement],
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<Flow> {
        for statement in body {
            if let Flow::Return(value) = self.exec_statement(statement, env, host)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_statement(
        &mut self,
        statement: &Statement,
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<Flow> {
        match statement {
            Statement::VarDecl {
                kind, name, init, ..
            } => {
                let value = match init {
                    Some(expr) => self.eval(expr, env, host)?,
                    None => JsValue::Undefined,
                };
                self.declare(env, name, value, *kind != DeclKind::Const);
                Ok(Flow::Normal)
            }
            // Hoisted when the enclosing body was entered.
            Statement::FunctionDecl(_) => Ok(Flow::Normal),
            Statement::ClassDecl(def) => {
                let class = self.create_class(def, env)?;
                let name = def.name.clone().unwrap_or_default();
                self.declare(env, &name, JsValue::Object(class), true);
                Ok(Flow::Normal)
            }
            Statement::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval(expr, env, host)?,
                    None => JsValue::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Statement::Throw { value, pos } => {
                let value = self.eval(value, env, host)?;
                self.set_position(*pos);
                Err(Interrupt::Throw {
                    value,
                    frames: self.capture_frames(),
                })
            }
            Statement::If {
                test,
                consequent,
                alternate,
                ..
            } => {
                if self.eval(test, env, host)?.truthy() {
                    self.exec_statements(consequent, env, host)
                } else if let Some(alternate) = alternate {
                    self.exec_statements(alternate, env, host)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Statement::Expression(expr) => {
                self.eval(expr, env, host)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn eval(&mut self, expr: &Expr, env: EnvHandle, host: &mut dyn Host) -> EvalResult<JsValue> {
        if self.eval_depth >= MAX_EVAL_DEPTH {
            self.set_position(expr.pos);
            return Err(self.throw_error(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }
        self.eval_depth += 1;
        let result = self.eval_expr(expr, env, host);
        self.eval_depth -= 1;
        result
    }

    fn eval_expr(&mut self, expr: &Expr, env: EnvHandle, host: &mut dyn Host) -> EvalResult<JsValue> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(match literal {
                Literal::Undefined => JsValue::Undefined,
                Literal::Null => JsValue::Null,
                Literal::Bool(b) => JsValue::Bool(*b),
                Literal::Number(n) => JsValue::Number(*n),
                Literal::Str(s) => JsValue::Str(s.clone()),
            }),
            ExprKind::Identifier(name) => {
                self.set_position(expr.pos);
                self.lookup(env, name)
            }
            ExprKind::This => Ok(self.this_value(env)),
            ExprKind::Array(items) => {
                let values = self.eval_list(items, env, host)?;
                Ok(JsValue::Object(self.heap.alloc_array(values)))
            }
            ExprKind::Object(entries) => {
                let handle = self.heap.alloc_plain();
                for (key, value) in entries {
                    let value = self.eval(value, env, host)?;
                    self.heap.set_property(handle, key.clone(), value)?;
                }
                Ok(JsValue::Object(handle))
            }
            ExprKind::Function(def) => Ok(JsValue::Object(self.create_function(
                def.clone(),
                env,
                FunctionKind::Plain,
            )?)),
            ExprKind::Class(def) => Ok(JsValue::Object(self.create_class(def, env)?)),
            ExprKind::Member { object, property } => {
                let target = self.eval(object, env, host)?;
                self.set_position(expr.pos);
                self.get_member(&target, property)
            }
            ExprKind::Index { object, index } => {
                let target = self.eval(object, env, host)?;
                let key = self.eval(index, env, host)?;
                let key = self.property_key(&key);
                self.set_position(expr.pos);
                self.get_member(&target, &key)
            }
            ExprKind::Call { callee, args } => self.eval_call(expr, callee, args, env, host),
            ExprKind::New { callee, args } => {
                let constructor = self.eval(callee, env, host)?;
                let args = self.eval_list(args, env, host)?;
                self.set_position(expr.pos);
                self.construct_value(&constructor, args, &callee_text(callee), host)
            }
            ExprKind::Unary { op, operand } => {
                if *op == UnaryOp::TypeOf
                    && let ExprKind::Identifier(name) = &operand.kind
                    && self.find_scope(env, name).is_none()
                {
                    return Ok(JsValue::str("undefined"));
                }
                let value = self.eval(operand, env, host)?;
                Ok(match op {
                    UnaryOp::Not => JsValue::Bool(!value.truthy()),
                    UnaryOp::Negate => JsValue::Number(-value.to_number()),
                    UnaryOp::TypeOf => JsValue::str(self.heap.type_of(&value)),
                })
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left, env, host)?;
                let right = self.eval(right, env, host)?;
                Ok(self.binary(*op, &left, &right))
            }
            ExprKind::Logical { op, left, right } => {
                let left = self.eval(left, env, host)?;
                match (op, left.truthy()) {
                    (LogicalOp::And, true) | (LogicalOp::Or, false) => self.eval(right, env, host),
                    _ => Ok(left),
                }
            }
            ExprKind::Assign { target, value } => self.eval_assign(target, value, env, host),
        }
    }

    fn eval_list(
        &mut self,
        exprs: &[Expr],
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<Vec<JsValue>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr, env, host)?);
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        expr: &Expr,
        callee: &Expr,
        args: &[Expr],
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let (function, this, is_method) = match &callee.kind {
            ExprKind::Member { object, property } => {
                let receiver = self.eval(object, env, host)?;
                self.set_position(callee.pos);
                let function = self.get_member(&receiver, property)?;
                (function, receiver, true)
            }
            ExprKind::Index { object, index } => {
                let receiver = self.eval(object, env, host)?;
                let key = self.eval(index, env, host)?;
                let key = self.property_key(&key);
                self.set_position(callee.pos);
                let function = self.get_member(&receiver, &key)?;
                (function, receiver, true)
            }
            _ => (self.eval(callee, env, host)?, JsValue::Undefined, false),
        };
        let args = self.eval_list(args, env, host)?;
        self.set_position(expr.pos);
        if !self.heap.is_callable(&function) {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                format!("{} is not a function", callee_text(callee)),
            ));
        }
        let frame_name = if is_method {
            self.method_frame_name(&function, &this)
        } else {
            self.function_name(&function)
        };
        self.call_with_name(&function, this, args, frame_name, host)
    }

    /// `Type.name` the way V8 labels method frames.
    fn method_frame_name(&self, function: &JsValue, receiver: &JsValue) -> String {
        let name = self.function_name(function);
        let name = if name.is_empty() {
            "<anonymous>".to_string()
        } else {
            name
        };
        let type_name = match receiver {
            JsValue::Object(_) if self.heap.is_callable(receiver) => "Function".to_string(),
            JsValue::Object(handle) => {
                let ctor = self
                    .heap
                    .get_property(*handle, "constructor")
                    .unwrap_or(JsValue::Undefined);
                let ctor_name = self.function_name(&ctor);
                if ctor_name.is_empty() {
                    "Object".to_string()
                } else {
                    ctor_name
                }
            }
            JsValue::Str(_) => "String".to_string(),
            JsValue::Number(_) => "Number".to_string(),
            JsValue::Bool(_) => "Boolean".to_string(),
            JsValue::Undefined | JsValue::Null => return name,
        };
        format!("{type_name}.{name}")
    }

    fn dispatch_of(&self, handle: ObjectHandle) -> EvalResult<Option<Dispatch>> {
        let object = self.heap.get(handle)?;
        Ok(match &object.kind {
            ObjectKind::Function { callable, .. } => Some(match callable {
                Callable::Script(function) => Dispatch::Script(function.clone()),
                Callable::Builtin(builtin) => Dispatch::Builtin(*builtin),
                Callable::Host { op, module_id } => Dispatch::Host(*op, module_id.clone()),
                Callable::Mock(_) => Dispatch::Mock,
            }),
            _ => None,
        })
    }

    fn call_with_name(
        &mut self,
        function: &JsValue,
        this: JsValue,
        args: Vec<JsValue>,
        frame_name: String,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let dispatch = match function.as_object() {
            Some(handle) => self.dispatch_of(handle)?.map(|d| (handle, d)),
            None => None,
        };
        let Some((handle, dispatch)) = dispatch else {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                format!("{} is not a function", self.to_display(function)),
            ));
        };
        match dispatch {
            Dispatch::Script(script) => self.call_script(script, this, args, frame_name, false, host),
            Dispatch::Builtin(builtin) => self.call_builtin(builtin, args),
            Dispatch::Host(op, module_id) => {
                self.frames.push(ActiveFrame {
                    function_name: format!("Runtime.{}", op.as_str()),
                    script: self.loader_label.clone(),
                    position: Position::new(1, 1),
                });
                let result = host.host_call(
                    self,
                    HostCall {
                        op,
                        module_id: &module_id,
                        this,
                        args,
                    },
                );
                self.frames.pop();
                result
            }
            Dispatch::Mock => self.call_mock(handle, this, args, host),
        }
    }

    fn call_script(
        &mut self,
        function: ScriptFunction,
        this: JsValue,
        args: Vec<JsValue>,
        frame_name: String,
        constructing: bool,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        if function.is_class_constructor && !constructing {
            let name = function.def.name.clone().unwrap_or_default();
            return Err(self.throw_error(
                ErrorKind::TypeError,
                format!("Class constructor {name} cannot be invoked without 'new'"),
            ));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.throw_error(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }
        let this_binding = (!function.def.is_arrow).then_some(this);
        let env = self.new_env(Some(function.env), this_binding);
        for (index, param) in function.def.params.iter().enumerate() {
            let value = args.get(index).cloned().unwrap_or(JsValue::Undefined);
            self.declare(env, param, value, true);
        }
        self.frames.push(ActiveFrame {
            function_name: frame_name,
            script: function.script.clone(),
            position: function.def.pos,
        });
        let result = match &function.def.body {
            FunctionBody::Block(body) => self
                .hoist_functions(body, env)
                .and_then(|()| self.exec_statements(body, env, host))
                .map(|flow| match flow {
                    Flow::Return(value) => value,
                    Flow::Normal => JsValue::Undefined,
                }),
            FunctionBody::Expression(expr) => self.eval(expr, env, host),
        };
        self.frames.pop();
        result
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<JsValue>) -> EvalResult<JsValue> {
        let first = args.into_iter().next().unwrap_or(JsValue::Undefined);
        match builtin {
            Builtin::ErrorCtor(kind) => {
                let message = match &first {
                    JsValue::Undefined => String::new(),
                    other => self.to_display(other),
                };
                Ok(self.create_error(kind, &message))
            }
            Builtin::MockReturnValue(mock) => {
                if let Some(state) = self.heap.mock_state_mut(mock)? {
                    state.return_value = Some(first);
                }
                Ok(JsValue::Object(mock))
            }
            Builtin::MockImplementation(mock) => {
                let implementation = match first {
                    JsValue::Undefined => None,
                    value if self.heap.is_callable(&value) => Some(value),
                    _ => {
                        return Err(self.throw_error(
                            ErrorKind::TypeError,
                            "mockImplementation expects a function",
                        ));
                    }
                };
                if let Some(state) = self.heap.mock_state_mut(mock)? {
                    state.implementation = implementation;
                }
                Ok(JsValue::Object(mock))
            }
            Builtin::MockClear(mock) => {
                if let Some(state) = self.heap.mock_state_mut(mock)? {
                    state.clear();
                }
                Ok(JsValue::Object(mock))
            }
        }
    }

    /// Record the call, then run the implementation or yield the canned value.
    fn call_mock(
        &mut self,
        mock: ObjectHandle,
        this: JsValue,
        args: Vec<JsValue>,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let (implementation, return_value) = match self.heap.mock_state_mut(mock)? {
            Some(state) => {
                state.calls.push(args.clone());
                (state.implementation.clone(), state.return_value.clone())
            }
            None => (None, None),
        };
        let result = match implementation {
            Some(implementation) => {
                let name = self.function_name(&implementation);
                self.call_with_name(&implementation, this, args, name, host)?
            }
            None => return_value.unwrap_or(JsValue::Undefined),
        };
        if let Some(state) = self.heap.mock_state_mut(mock)? {
            state.results.push(result.clone());
        }
        Ok(result)
    }

    fn construct_value(
        &mut self,
        constructor: &JsValue,
        args: Vec<JsValue>,
        label: &str,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        let dispatch = match constructor.as_object() {
            Some(handle) => self.dispatch_of(handle)?.map(|d| (handle, d)),
            None => None,
        };
        match dispatch {
            Some((handle, Dispatch::Script(function))) if !function.def.is_arrow => {
                let proto = self.heap.get_property(handle, "prototype")?.as_object();
                let instance = self.heap.alloc(ObjectKind::Plain, proto);
                let frame_name = format!("new {}", self.function_name(constructor));
                let result = self.call_script(
                    function,
                    JsValue::Object(instance),
                    args,
                    frame_name,
                    true,
                    host,
                )?;
                Ok(if result.is_primitive() {
                    JsValue::Object(instance)
                } else {
                    result
                })
            }
            Some((_, Dispatch::Builtin(builtin @ Builtin::ErrorCtor(_)))) => {
                self.call_builtin(builtin, args)
            }
            Some((handle, Dispatch::Mock)) => {
                let proto = self.heap.get_property(handle, "prototype")?.as_object();
                let instance = JsValue::Object(self.heap.alloc(ObjectKind::Plain, proto));
                if let Some(state) = self.heap.mock_state_mut(handle)? {
                    state.instances.push(instance.clone());
                }
                let result = self.call_mock(handle, instance.clone(), args, host)?;
                Ok(if result.is_primitive() { instance } else { result })
            }
            _ => Err(self.throw_error(
                ErrorKind::TypeError,
                format!("{label} is not a constructor"),
            )),
        }
    }

    fn create_function(
        &mut self,
        def: Arc<FunctionDef>,
        env: EnvHandle,
        kind: FunctionKind,
    ) -> EvalResult<ObjectHandle> {
        let name = def.name.clone().unwrap_or_default();
        let has_prototype = !def.is_arrow && kind != FunctionKind::Method;
        let script = self.current_script();
        let handle = self.heap.alloc_function(
            name,
            Callable::Script(ScriptFunction {
                def,
                env,
                script,
                is_class_constructor: kind == FunctionKind::ClassConstructor,
            }),
        );
        if has_prototype {
            let proto = self.heap.alloc_with(
                ObjectKind::Plain,
                None,
                [("constructor".to_string(), JsValue::Object(handle))],
            );
            self.heap
                .set_property(handle, "prototype", JsValue::Object(proto))?;
        }
        Ok(handle)
    }

    fn create_class(&mut self, def: &ClassDef, env: EnvHandle) -> EvalResult<ObjectHandle> {
        let class = self.create_function(
            def.constructor.clone(),
            env,
            FunctionKind::ClassConstructor,
        )?;
        let proto = self.heap.get_property(class, "prototype")?.as_object();
        for member in &def.members {
            let method = self.create_function(member.function.clone(), env, FunctionKind::Method)?;
            let target = if member.is_static { Some(class) } else { proto };
            if let Some(target) = target {
                self.heap
                    .set_property(target, member.name.clone(), JsValue::Object(method))?;
            }
        }
        Ok(class)
    }

    fn get_member(&mut self, target: &JsValue, key: &str) -> EvalResult<JsValue> {
        match target {
            JsValue::Object(handle) => Ok(self.heap.get_property(*handle, key)?),
            JsValue::Str(s) if key == "length" => Ok(JsValue::Number(s.chars().count() as f64)),
            JsValue::Undefined | JsValue::Null => Err(self.throw_error(
                ErrorKind::TypeError,
                format!("Cannot read properties of {target} (reading '{key}')"),
            )),
            _ => Ok(JsValue::Undefined),
        }
    }

    fn set_member(&mut self, target: &JsValue, key: &str, value: JsValue) -> EvalResult<()> {
        match target {
            JsValue::Object(handle) => Ok(self.heap.set_property(*handle, key, value)?),
            JsValue::Undefined | JsValue::Null => Err(self.throw_error(
                ErrorKind::TypeError,
                format!("Cannot set properties of {target} (setting '{key}')"),
            )),
            _ => Ok(()),
        }
    }

    fn property_key(&self, value: &JsValue) -> String {
        match value {
            JsValue::Str(s) => s.clone(),
            JsValue::Number(n) => format_number(*n),
            other => self.to_display(other),
        }
    }

    fn eval_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        env: EnvHandle,
        host: &mut dyn Host,
    ) -> EvalResult<JsValue> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                let value = self.eval(value, env, host)?;
                self.set_position(target.pos);
                self.assign_binding(env, name, value.clone())?;
                Ok(value)
            }
            ExprKind::Member { object, property } => {
                let object = self.eval(object, env, host)?;
                let value = self.eval(value, env, host)?;
                self.set_position(target.pos);
                self.set_member(&object, property, value.clone())?;
                Ok(value)
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object, env, host)?;
                let key = self.eval(index, env, host)?;
                let key = self.property_key(&key);
                let value = self.eval(value, env, host)?;
                self.set_position(target.pos);
                self.set_member(&object, &key, value.clone())?;
                Ok(value)
            }
            _ => Err(self.throw_error(ErrorKind::ReferenceError, "Invalid left-hand side in assignment")),
        }
    }

    fn binary(&self, op: BinaryOp, left: &JsValue, right: &JsValue) -> JsValue {
        match op {
            BinaryOp::Add => {
                let concat = matches!(left, JsValue::Str(_))
                    || matches!(right, JsValue::Str(_))
                    || !left.is_primitive()
                    || !right.is_primitive();
                if concat {
                    JsValue::Str(format!("{}{}", self.to_display(left), self.to_display(right)))
                } else {
                    JsValue::Number(left.to_number() + right.to_number())
                }
            }
            BinaryOp::Sub => JsValue::Number(left.to_number() - right.to_number()),
            BinaryOp::Mul => JsValue::Number(left.to_number() * right.to_number()),
            BinaryOp::Div => JsValue::Number(left.to_number() / right.to_number()),
            BinaryOp::StrictEq => JsValue::Bool(left.strict_equals(right)),
            BinaryOp::StrictNe => JsValue::Bool(!left.strict_equals(right)),
            BinaryOp::LooseEq => JsValue::Bool(left.loose_equals(right)),
            BinaryOp::LooseNe => JsValue::Bool(!left.loose_equals(right)),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let ordering = match (left, right) {
                    (JsValue::Str(a), JsValue::Str(b)) => Some(a.cmp(b)),
                    _ => left.to_number().partial_cmp(&right.to_number()),
                };
                let Some(ordering) = ordering else {
                    return JsValue::Bool(false);
                };
                JsValue::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Le => ordering.is_le(),
                    _ => ordering.is_ge(),
                })
            }
        }
    }
}

/// Source-ish rendering of a callee for `x is not a function` messages.
fn callee_text(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Identifier(name) => name.clone(),
        ExprKind::This => "this".to_string(),
        ExprKind::Member { object, property } => format!("{}.{property}", callee_text(object)),
        ExprKind::Index { object, .. } => format!("{}[...]", callee_text(object)),
        ExprKind::Call { callee, .. } => format!("{}(...)", callee_text(callee)),
        _ => "expression".to_string(),
    }
}
