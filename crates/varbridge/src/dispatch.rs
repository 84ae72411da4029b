//! Action dispatcher: runs one decoded request against a [`SymbolTable`].
//!
//! The symbol table is the host side of the bridge. Synchronous operations have
//! default implementations built on [`SymbolTable::get`] and [`SymbolTable::set`];
//! the evaluating operations are async because they may issue nested requests to
//! the peer through a [`Peer`] while they run.
//!
//! Names that arrive as reference handles never reach the table for lookup; they are
//! resolved through the session's reference table instead.

use std::fmt;

use futures::future::BoxFuture;

use crate::bridge::protocol::{Action, Args, Message, Name};
use crate::error::{BridgeError, EvalError};
use crate::refs::Handle;
use crate::session::{Reply, Session};
use crate::value::{Index, Value};

/// A name plus the member path applied to its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub members: Vec<String>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.members.push(member.into());
        self
    }

    /// Follow the member path from `root`.
    pub fn select<'v>(&self, root: &'v Value) -> Result<&'v Value, EvalError> {
        let mut value = root;
        let mut owner = self.name.clone();
        for member in &self.members {
            value = value.member(member).ok_or_else(|| EvalError::NoMember {
                name: owner.clone(),
                member: member.clone(),
            })?;
            owner = format!("{owner}.{member}");
        }
        Ok(value)
    }

    pub fn select_mut<'v>(&self, root: &'v mut Value) -> Result<&'v mut Value, EvalError> {
        let mut value = root;
        let mut owner = self.name.clone();
        for member in &self.members {
            value = value.member_mut(member).ok_or_else(|| EvalError::NoMember {
                name: owner.clone(),
                member: member.clone(),
            })?;
            owner = format!("{owner}.{member}");
        }
        Ok(value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for member in &self.members {
            write!(f, ".{member}")?;
        }
        Ok(())
    }
}

/// Decoded call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every argument value, positional first.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.positional
            .iter()
            .chain(self.named.iter().map(|(_, v)| v))
    }
}

/// The local symbol table a session serves requests against.
#[async_trait::async_trait]
pub trait SymbolTable: Send {
    fn get(&self, name: &str) -> Result<Value, EvalError>;

    fn set(&mut self, name: &str, value: Value) -> Result<(), EvalError>;

    /// Read a slice of a (member of a) variable. An empty index returns the whole value.
    fn get_slice(&self, target: &Target, index: &[Index]) -> Result<Value, EvalError> {
        let root = self.get(&target.name)?;
        let value = target.select(&root)?;
        if index.is_empty() {
            return Ok(value.clone());
        }
        value.get_index(index)
    }

    fn set_slice(&mut self, target: &Target, index: &[Index], value: Value) -> Result<(), EvalError> {
        let mut root = self.get(&target.name)?;
        let slot = target.select_mut(&mut root)?;
        if index.is_empty() {
            *slot = value;
        } else {
            slot.set_index(index, value)?;
        }
        self.set(&target.name, root)
    }

    fn shape(&self, name: &str) -> Result<Value, EvalError> {
        Ok(self.get(name)?.shape())
    }

    /// Invoke a value directly, e.g. a callable held behind a reference.
    fn call_value(&mut self, callee: &Value, _args: CallArgs) -> Result<Option<Value>, EvalError> {
        Err(EvalError::NotCallable(callee.type_name()))
    }

    /// Call a named function. `Ok(None)` means the callee produced no value.
    async fn call(
        &mut self,
        target: &Target,
        args: CallArgs,
        expect_result: bool,
        peer: &mut Peer<'_>,
    ) -> Result<Option<Value>, EvalError>;

    async fn evaluate(&mut self, text: &str, peer: &mut Peer<'_>) -> Result<Value, EvalError>;

    async fn execute(&mut self, text: &str, peer: &mut Peer<'_>) -> Result<(), EvalError>;
}

/// Requester side of the session, lent to a symbol table while it runs.
pub struct Peer<'a> {
    session: Option<&'a mut Session>,
}

impl<'a> Peer<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// A peer with no session behind it; every request fails with `SessionClosed`.
    pub fn detached() -> Self {
        Self { session: None }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Send a request and wait for its reply, serving nested requests meanwhile.
    pub fn request<'s>(
        &'s mut self,
        action: Action,
        table: &'s mut dyn SymbolTable,
    ) -> BoxFuture<'s, Result<Reply, BridgeError>> {
        match self.session.as_deref_mut() {
            Some(session) => session.request(action, table),
            None => Box::pin(async { Err(BridgeError::SessionClosed) }),
        }
    }
}

/// Result of a dispatched request, before it is written back.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Value),
    /// Answer with a reference message naming a held value.
    Reference(Handle),
    Done,
}

impl From<Option<Value>> for Outcome {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Outcome::Done, Outcome::Value)
    }
}

/// Convert a passive message, resolving references through the session.
fn to_value(session: &Session, message: Message) -> Result<Value, BridgeError> {
    Value::from_message(message, &mut |handle| {
        session.refs().resolve(handle).cloned().map_err(BridgeError::from)
    })
}

fn to_call_args(session: &Session, args: Args) -> Result<CallArgs, BridgeError> {
    Ok(CallArgs {
        positional: args
            .positional
            .into_iter()
            .map(|m| to_value(session, m))
            .collect::<Result<_, _>>()?,
        named: args
            .named
            .into_iter()
            .map(|(k, m)| to_value(session, m).map(|v| (k, v)))
            .collect::<Result<_, _>>()?,
    })
}

fn is_member_path(message: &Message) -> bool {
    match message {
        Message::List(items) => !items.is_empty() && items.iter().all(|m| m.as_str().is_some()),
        _ => false,
    }
}

/// Split a call's argument list into the member path and the real arguments.
///
/// Only a leading list made entirely of scalar strings is a member path; plain string
/// arguments stay positional.
fn split_call_args(mut args: Args) -> (Vec<String>, Args) {
    if !args.positional.first().is_some_and(is_member_path) {
        return (Vec::new(), args);
    }
    let Message::List(path) = args.positional.remove(0) else {
        return (Vec::new(), args);
    };
    let members = path
        .iter()
        .filter_map(|m| m.as_str().map(str::to_string))
        .collect();
    (members, args)
}

/// Split a slice index list: scalar strings are member keys, the rest are indices.
fn split_index(session: &Session, index: Args) -> Result<(Vec<String>, Vec<Index>), BridgeError> {
    if let Some((key, _)) = index.named.first() {
        return Err(BridgeError::invalid_argument(format!(
            "keyword argument '{key}' in a slice index"
        )));
    }
    let mut members = Vec::new();
    let mut indices = Vec::new();
    for item in index.positional {
        if let Some(key) = item.as_str() {
            members.push(key.to_string());
            continue;
        }
        let value = to_value(session, item)?;
        indices.push(Index::from_value(&value)?);
    }
    Ok((members, indices))
}

fn target(name: String, members: Vec<String>) -> Target {
    Target { name, members }
}

/// Run one request. Recoverable failures come back as `Err` for the session to report.
pub async fn dispatch(
    session: &mut Session,
    table: &mut dyn SymbolTable,
    action: Action,
) -> Result<Outcome, BridgeError> {
    match action {
        Action::Evaluate(text) => {
            let value = table.evaluate(&text, &mut Peer::new(session)).await?;
            Ok(Outcome::Value(value))
        }
        Action::Execute(text) => {
            table.execute(&text, &mut Peer::new(session)).await?;
            Ok(Outcome::Done)
        }
        Action::GetVar(Name::Literal(name)) if name.is_empty() => {
            match session.refs_mut().take_pending() {
                Some((handle, _)) => Ok(Outcome::Reference(handle)),
                None => Err(EvalError::NoPendingResult.into()),
            }
        }
        Action::GetVar(Name::Literal(name)) => Ok(Outcome::Value(table.get(&name)?)),
        Action::GetVar(Name::Reference(handle)) => {
            let value = session.refs().resolve(handle)?;
            if value.to_message().is_some() {
                Ok(Outcome::Value(value.clone()))
            } else {
                Ok(Outcome::Reference(handle))
            }
        }
        Action::SetVar { name, value } => {
            let value = to_value(session, *value)?;
            match name {
                Name::Literal(name) => table.set(&name, value)?,
                Name::Reference(handle) => {
                    session.refs_mut().replace(handle, value)?;
                }
            }
            Ok(Outcome::Done)
        }
        Action::Call {
            name,
            args,
            expect_result,
        } => call(session, table, name, args, expect_result).await,
        Action::SubroutineCall { name, args } => call(session, table, name, args, false).await,
        Action::GetSlice { name, index } => {
            let (members, indices) = split_index(session, index)?;
            match name {
                Name::Literal(name) => Ok(Outcome::Value(
                    table.get_slice(&target(name, members), &indices)?,
                )),
                Name::Reference(handle) => {
                    let root = session.refs().resolve(handle)?;
                    let value = target(handle.to_string(), members).select(root)?;
                    let result = if indices.is_empty() {
                        value.clone()
                    } else {
                        value.get_index(&indices)?
                    };
                    Ok(Outcome::Value(result))
                }
            }
        }
        Action::SetSlice { name, index, value } => {
            let (members, indices) = split_index(session, index)?;
            let value = to_value(session, *value)?;
            match name {
                Name::Literal(name) => table.set_slice(&target(name, members), &indices, value)?,
                Name::Reference(handle) => {
                    let root = session.refs_mut().resolve_mut(handle)?;
                    let slot = target(handle.to_string(), members).select_mut(root)?;
                    if indices.is_empty() {
                        *slot = value;
                    } else {
                        slot.set_index(&indices, value)?;
                    }
                }
            }
            Ok(Outcome::Done)
        }
        Action::GetShape(Name::Literal(name)) => Ok(Outcome::Value(table.shape(&name)?)),
        Action::GetShape(Name::Reference(handle)) => {
            Ok(Outcome::Value(session.refs().resolve(handle)?.shape()))
        }
        Action::Release(handle) => {
            session.refs_mut().release(handle)?;
            Ok(Outcome::Done)
        }
    }
}

async fn call(
    session: &mut Session,
    table: &mut dyn SymbolTable,
    name: Name,
    args: Args,
    expect_result: bool,
) -> Result<Outcome, BridgeError> {
    let (members, args) = split_call_args(args);

    match name {
        Name::Literal(name) if members.is_empty() && args.is_empty() => {
            tracing::debug!(%name, expect_result, "Bare call routed as evaluation");
            let mut peer = Peer::new(session);
            if expect_result {
                Ok(Outcome::Value(table.evaluate(&name, &mut peer).await?))
            } else {
                table.execute(&name, &mut peer).await?;
                Ok(Outcome::Done)
            }
        }
        Name::Literal(name) => {
            let args = to_call_args(session, args)?;
            let result = table
                .call(&target(name, members), args, expect_result, &mut Peer::new(session))
                .await?;
            Ok(if expect_result { result.into() } else { Outcome::Done })
        }
        Name::Reference(handle) => {
            let args = to_call_args(session, args)?;
            let root = session.refs().resolve(handle)?;
            let callee = target(handle.to_string(), members).select(root)?.clone();
            let result = table.call_value(&callee, args)?;
            Ok(if expect_result { result.into() } else { Outcome::Done })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_path_needs_leading_string_list() {
        let args = Args::positional([
            Message::List(vec![Message::string("a"), Message::string("b")]),
            Message::int(1),
        ]);
        let (members, rest) = split_call_args(args);
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(rest.positional, vec![Message::int(1)]);

        let args = Args::positional([Message::string("a"), Message::int(1)]);
        let (members, rest) = split_call_args(args);
        assert!(members.is_empty());
        assert_eq!(rest.positional.len(), 2);

        let args = Args::positional([Message::List(vec![Message::string("a"), Message::int(1)])]);
        let (members, rest) = split_call_args(args);
        assert!(members.is_empty());
        assert_eq!(rest.positional.len(), 1);
    }

    #[test]
    fn target_follows_members() {
        let root = Value::Dict(vec![(
            "inner".into(),
            Value::Dict(vec![("x".into(), Value::int(3))]),
        )]);
        let t = Target::new("cfg").with_member("inner").with_member("x");
        assert_eq!(t.to_string(), "cfg.inner.x");
        assert_eq!(t.select(&root).unwrap(), &Value::int(3));

        let missing = Target::new("cfg").with_member("inner").with_member("y");
        assert_eq!(
            missing.select(&root).unwrap_err(),
            EvalError::NoMember {
                name: "cfg.inner".into(),
                member: "y".into()
            }
        );
    }

    #[test]
    fn call_args_values_iterate_positional_first() {
        let args = CallArgs {
            positional: vec![Value::int(1), Value::int(2)],
            named: vec![("k".into(), Value::int(3))],
        };
        let sum: i64 = args.values().filter_map(Value::as_i64).sum();
        assert_eq!(sum, 6);
        assert_eq!(args.len(), 3);
    }

    #[tokio::test]
    async fn detached_peer_refuses_requests() {
        struct Empty;

        #[async_trait::async_trait]
        impl SymbolTable for Empty {
            fn get(&self, name: &str) -> Result<Value, EvalError> {
                Err(EvalError::NotFound(name.to_string()))
            }
            fn set(&mut self, _name: &str, _value: Value) -> Result<(), EvalError> {
                Ok(())
            }
            async fn call(
                &mut self,
                target: &Target,
                _args: CallArgs,
                _expect_result: bool,
                _peer: &mut Peer<'_>,
            ) -> Result<Option<Value>, EvalError> {
                Err(EvalError::NotCallable(target.to_string()))
            }
            async fn evaluate(&mut self, text: &str, _peer: &mut Peer<'_>) -> Result<Value, EvalError> {
                Err(EvalError::Syntax(text.to_string()))
            }
            async fn execute(&mut self, _text: &str, _peer: &mut Peer<'_>) -> Result<(), EvalError> {
                Ok(())
            }
        }

        let mut peer = Peer::detached();
        let mut table = Empty;
        assert!(!peer.is_connected());
        let err = peer
            .request(Action::GetVar(Name::literal("x")), &mut table)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SessionClosed));
    }
}
