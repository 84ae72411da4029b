//! In-memory symbol table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use varbridge::bridge::types::Scalar;
use varbridge::{CallArgs, EvalError, Mode, ModeSwitch, Opaque, Peer, SymbolTable, Target, Value};

use crate::eval::{self, Interpreter};

/// Type name of function values.
pub const FUNCTION: &str = "function";

type NativeFn = dyn Fn(&CallArgs) -> Result<Option<Value>, EvalError> + Send + Sync;

/// A native function stored in the table. It has no wire form, so reading it
/// remotely yields a reference.
#[derive(Clone)]
pub struct Function {
    name: String,
    body: Arc<NativeFn>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: &CallArgs) -> Result<Option<Value>, EvalError> {
        (self.body)(args)
    }

    pub fn from_value(value: &Value) -> Option<&Function> {
        match value {
            Value::Opaque(o) => o.downcast_ref::<Function>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}

/// Variables and native functions in one namespace.
#[derive(Debug, Default)]
pub struct MemoryTable {
    vars: HashMap<String, Value>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the builtin `sum` and `len`.
    pub fn with_prelude() -> Self {
        let mut table = Self::new();
        table.define_fn("sum", sum);
        table.define_fn("len", len);
        table
    }

    pub fn define_fn<F>(&mut self, name: &str, body: F)
    where
        F: Fn(&CallArgs) -> Result<Option<Value>, EvalError> + Send + Sync + 'static,
    {
        let function = Function {
            name: name.to_string(),
            body: Arc::new(body),
        };
        self.vars
            .insert(name.to_string(), Value::Opaque(Opaque::new(FUNCTION, function)));
    }

    /// Define `interactive()` and `service()`, which request a mode change on `switch`.
    ///
    /// Either side can call them. The session applies the change once the current
    /// request has been answered.
    pub fn define_mode_control(&mut self, switch: ModeSwitch) {
        for (name, mode) in [("interactive", Mode::Interactive), ("service", Mode::Service)] {
            let switch = switch.clone();
            self.define_fn(name, move |args| {
                if !args.is_empty() {
                    return Err(EvalError::Arity {
                        name: name.to_string(),
                        expected: 0,
                        got: args.len(),
                    });
                }
                tracing::debug!(?mode, "Mode change requested");
                switch.request(mode);
                Ok(None)
            });
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub(crate) fn invoke(
        &self,
        callee: &Value,
        label: &str,
        args: &CallArgs,
    ) -> Result<Option<Value>, EvalError> {
        let function =
            Function::from_value(callee).ok_or_else(|| EvalError::NotCallable(label.to_string()))?;
        tracing::trace!(function = function.name(), args = args.len(), "Calling native function");
        function.invoke(args)
    }
}

#[async_trait]
impl SymbolTable for MemoryTable {
    fn get(&self, name: &str) -> Result<Value, EvalError> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(name.to_string()))
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        if name.is_empty() {
            return Err(EvalError::failed("cannot assign to an empty name"));
        }
        self.vars.insert(name.to_string(), value);
        Ok(())
    }

    fn call_value(&mut self, callee: &Value, args: CallArgs) -> Result<Option<Value>, EvalError> {
        self.invoke(callee, &callee.type_name(), &args)
    }

    async fn call(
        &mut self,
        target: &Target,
        args: CallArgs,
        _expect_result: bool,
        _peer: &mut Peer<'_>,
    ) -> Result<Option<Value>, EvalError> {
        let root = self
            .vars
            .get(&target.name)
            .ok_or_else(|| EvalError::NotFound(target.name.clone()))?;
        let callee = target.select(root)?;
        self.invoke(callee, &target.to_string(), &args)
    }

    async fn evaluate(&mut self, text: &str, peer: &mut Peer<'_>) -> Result<Value, EvalError> {
        let program = eval::parse(text)?;
        let remotes = eval::fetch_remotes(&program, self, peer).await?;
        Interpreter::new(self, &remotes).run(&program)
    }

    async fn execute(&mut self, text: &str, peer: &mut Peer<'_>) -> Result<(), EvalError> {
        let program = eval::parse(text)?;
        let remotes = eval::fetch_remotes(&program, self, peer).await?;
        Interpreter::new(self, &remotes).run(&program).map(|_| ())
    }
}

/// Adds every numeric argument, positional and named. Integers stay integers.
fn sum(args: &CallArgs) -> Result<Option<Value>, EvalError> {
    let mut ints: i64 = 0;
    let mut floats = 0.0;
    let mut any_float = false;
    for value in args.values() {
        let Value::Array(array) = value else {
            return Err(EvalError::type_mismatch(format!(
                "sum: cannot add a {}",
                value.type_name()
            )));
        };
        for i in 0..array.len() {
            match array.get(i) {
                Some(Scalar::Int(v)) => {
                    ints = ints
                        .checked_add(v)
                        .ok_or_else(|| EvalError::failed("sum: integer overflow"))?;
                }
                Some(Scalar::Float(v)) => {
                    any_float = true;
                    floats += v;
                }
                None => {}
            }
        }
    }
    Ok(Some(if any_float {
        Value::float(floats + ints as f64)
    } else {
        Value::int(ints)
    }))
}

/// Element count of an array, list or dict; character count of a single string.
fn len(args: &CallArgs) -> Result<Option<Value>, EvalError> {
    let ([value], true) = (args.positional.as_slice(), args.named.is_empty()) else {
        return Err(EvalError::Arity {
            name: "len".to_string(),
            expected: 1,
            got: args.len(),
        });
    };
    let count = match value {
        Value::Nil => 0,
        Value::Array(a) => a.len(),
        Value::Strings(s) => match s.as_scalar() {
            Some(text) => text.chars().count(),
            None => s.len(),
        },
        Value::List(items) => items.len(),
        Value::Dict(entries) => entries.len(),
        other => {
            return Err(EvalError::type_mismatch(format!(
                "len: a {} has no length",
                other.type_name()
            )));
        }
    };
    Ok(Some(Value::int(count as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(positional: Vec<Value>, named: Vec<(&str, Value)>) -> CallArgs {
        CallArgs {
            positional,
            named: named.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    #[test]
    fn sum_adds_positional_and_named() {
        let total = sum(&args(
            vec![Value::int(1), Value::int(2)],
            vec![("k", Value::int(3))],
        ))
        .unwrap();
        assert_eq!(total, Some(Value::int(6)));

        let mixed = sum(&args(vec![Value::ints(vec![1, 2]), Value::float(0.5)], vec![])).unwrap();
        assert_eq!(mixed, Some(Value::float(3.5)));

        assert!(sum(&args(vec![Value::string("x")], vec![])).is_err());
    }

    #[test]
    fn len_counts_elements() {
        let one = |v: Value| len(&args(vec![v], vec![])).unwrap();
        assert_eq!(one(Value::ints(vec![1, 2, 3])), Some(Value::int(3)));
        assert_eq!(one(Value::string("héllo")), Some(Value::int(5)));
        assert_eq!(one(Value::List(vec![Value::Nil; 2])), Some(Value::int(2)));
        assert!(matches!(
            len(&args(vec![], vec![])),
            Err(EvalError::Arity { got: 0, .. })
        ));
    }

    #[test]
    fn functions_are_opaque_values() {
        let table = MemoryTable::with_prelude();
        let value = table.get("sum").unwrap();
        assert!(value.is_opaque());
        assert_eq!(value.to_message(), None);
        assert_eq!(Function::from_value(&value).map(Function::name), Some("sum"));
    }

    #[test]
    fn set_rejects_the_empty_name() {
        let mut table = MemoryTable::new();
        assert!(table.set("", Value::int(1)).is_err());
        table.set("x", Value::int(1)).unwrap();
        assert_eq!(table.lookup("x"), Some(&Value::int(1)));
        assert!(matches!(table.get("y"), Err(EvalError::NotFound(_))));
    }

    #[test]
    fn call_value_invokes_functions_only() {
        let mut table = MemoryTable::with_prelude();
        let sum_fn = table.get("sum").unwrap();
        assert_eq!(
            table
                .call_value(&sum_fn, args(vec![Value::int(4)], vec![]))
                .unwrap(),
            Some(Value::int(4))
        );
        assert!(matches!(
            table.call_value(&Value::int(1), CallArgs::default()),
            Err(EvalError::NotCallable(_))
        ));
    }

    #[tokio::test]
    async fn call_resolves_members() {
        let mut table = MemoryTable::with_prelude();
        let sum_fn = table.get("sum").unwrap();
        table.insert("ops", Value::Dict(vec![("add".to_string(), sum_fn)]));

        let target = Target::new("ops").with_member("add");
        let result = table
            .call(
                &target,
                args(vec![Value::int(2), Value::int(5)], vec![]),
                true,
                &mut Peer::detached(),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(Value::int(7)));

        let err = table
            .call(&Target::new("ops"), CallArgs::default(), true, &mut Peer::detached())
            .await
            .unwrap_err();
        assert_eq!(err, EvalError::NotCallable("ops".to_string()));
    }

    #[tokio::test]
    async fn mode_builtins_drive_the_session_switch() {
        let (_peer_out, host_in) = tokio::io::duplex(1024);
        let (host_out, _peer_in) = tokio::io::duplex(1024);
        let mut session = varbridge::Session::open(host_in, host_out, Default::default());
        let mut table = MemoryTable::new();
        table.define_mode_control(session.mode_switch());

        table.execute("interactive()", &mut Peer::detached()).await.unwrap();
        assert_eq!(session.run(&mut table).await.unwrap(), varbridge::RunExit::Interactive);
        assert_eq!(session.mode(), Mode::Interactive);

        assert!(matches!(
            table.evaluate("service(1)", &mut Peer::detached()).await,
            Err(EvalError::Arity { expected: 0, got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn evaluate_without_a_session() {
        let mut table = MemoryTable::with_prelude();
        let mut peer = Peer::detached();
        table.execute("x = [1, 2, 3]", &mut peer).await.unwrap();
        assert_eq!(
            table.evaluate("sum(x) * 2", &mut peer).await.unwrap(),
            Value::int(12)
        );
        assert!(matches!(
            table.evaluate("remote('y')", &mut peer).await,
            Err(EvalError::Remote(_))
        ));
    }
}
