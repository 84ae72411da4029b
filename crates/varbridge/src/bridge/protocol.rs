//! Message types exchanged between the two peers.
//!
//! A message is either passive (a value, a terminator) or active (a request that
//! obliges the receiver to answer with exactly one response). Kind numbers are
//! fixed by the wire format; see [`kind`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{NumericArray, RangeSpec, StringArray};
use crate::refs::Handle;

/// Wire `kind` values that are not numeric element types.
pub mod kind {
    pub const EOL: i32 = 0;
    pub const STRINGS: i32 = 7;
    pub const NIL: i32 = 20;
    pub const RANGE: i32 = 21;
    pub const LIST: i32 = 22;
    pub const DICT: i32 = 23;
    pub const REFERENCE: i32 = 24;
    pub const EVALUATE: i32 = 30;
    pub const EXECUTE: i32 = 31;
    pub const GET_VAR: i32 = 32;
    pub const SET_VAR: i32 = 33;
    pub const CALL: i32 = 34;
    pub const SUBROUTINE_CALL: i32 = 35;
    pub const GET_SLICE: i32 = 36;
    pub const SET_SLICE: i32 = 37;
    pub const GET_SHAPE: i32 = 38;
    pub const RELEASE: i32 = 39;
}

/// Flag carried by an end-of-list marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EolFlag {
    /// Normal terminator.
    Ok,
    /// The request failed; a description precedes the marker.
    Error,
    /// The result has no wire form and is held as the pending reference.
    Unencodable,
    /// The sender is terminating the session.
    Shutdown,
}

impl EolFlag {
    pub fn from_wire(flag: i32) -> Option<Self> {
        match flag {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::Unencodable),
            -1 => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::Unencodable => 2,
            Self::Shutdown => -1,
        }
    }
}

/// Target name of a request: a literal identifier or a held reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Name {
    Literal(String),
    Reference(Handle),
}

impl Name {
    pub fn literal(name: impl Into<String>) -> Self {
        Self::Literal(name.into())
    }

    pub(crate) fn tag(&self) -> i32 {
        match self {
            Self::Literal(_) => 0,
            Self::Reference(_) => 1,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(name) => f.write_str(name),
            Self::Reference(handle) => write!(f, "{handle}"),
        }
    }
}

/// Argument list of a call or slice.
///
/// On the wire this is one List: named entries are `SetVar` sub-messages with a
/// literal name, everything else is positional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    pub positional: Vec<Message>,
    pub named: Vec<(String, Message)>,
}

impl Args {
    pub fn positional(items: impl IntoIterator<Item = Message>) -> Self {
        Self {
            positional: items.into_iter().collect(),
            named: Vec::new(),
        }
    }

    pub fn with_named(mut self, key: impl Into<String>, value: Message) -> Self {
        self.named.push((key.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub(crate) fn from_items(items: Vec<Message>) -> Self {
        let mut args = Args::default();
        for item in items {
            match item {
                Message::Action(Action::SetVar {
                    name: Name::Literal(key),
                    value,
                }) => args.named.push((key, *value)),
                other => args.positional.push(other),
            }
        }
        args
    }
}

/// A request. Each one is answered by exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Evaluate(String),
    Execute(String),
    GetVar(Name),
    SetVar {
        name: Name,
        value: Box<Message>,
    },
    Call {
        name: Name,
        args: Args,
        expect_result: bool,
    },
    SubroutineCall {
        name: Name,
        args: Args,
    },
    GetSlice {
        name: Name,
        index: Args,
    },
    SetSlice {
        name: Name,
        index: Args,
        value: Box<Message>,
    },
    GetShape(Name),
    Release(Handle),
}

impl Action {
    pub fn kind(&self) -> i32 {
        match self {
            Self::Evaluate(_) => kind::EVALUATE,
            Self::Execute(_) => kind::EXECUTE,
            Self::GetVar(_) => kind::GET_VAR,
            Self::SetVar { .. } => kind::SET_VAR,
            Self::Call { .. } => kind::CALL,
            Self::SubroutineCall { .. } => kind::SUBROUTINE_CALL,
            Self::GetSlice { .. } => kind::GET_SLICE,
            Self::SetSlice { .. } => kind::SET_SLICE,
            Self::GetShape(_) => kind::GET_SHAPE,
            Self::Release(_) => kind::RELEASE,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Evaluate(_) => "evaluate",
            Self::Execute(_) => "execute",
            Self::GetVar(_) => "get_var",
            Self::SetVar { .. } => "set_var",
            Self::Call { .. } => "call",
            Self::SubroutineCall { .. } => "subroutine_call",
            Self::GetSlice { .. } => "get_slice",
            Self::SetSlice { .. } => "set_slice",
            Self::GetShape(_) => "get_shape",
            Self::Release(_) => "release",
        }
    }

    pub fn set_var(name: impl Into<String>, value: Message) -> Self {
        Self::SetVar {
            name: Name::literal(name),
            value: Box::new(value),
        }
    }

    pub fn call(name: impl Into<String>, args: Args) -> Self {
        Self::Call {
            name: Name::literal(name),
            args,
            expect_result: true,
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Eol(EolFlag),
    Array(NumericArray),
    Strings(StringArray),
    Range(RangeSpec),
    Nil,
    List(Vec<Message>),
    /// Ordered entries; keys are not deduplicated.
    Dict(Vec<(String, Message)>),
    Reference(Handle),
    Action(Action),
}

impl Message {
    pub fn int(value: i64) -> Self {
        Self::Array(NumericArray::scalar_i64(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Array(NumericArray::scalar_f64(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Strings(StringArray::scalar(value))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Action(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Eol(_) => "eol",
            Self::Array(_) => "array",
            Self::Strings(_) => "strings",
            Self::Range(_) => "range",
            Self::Nil => "nil",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Reference(_) => "reference",
            Self::Action(action) => action.label(),
        }
    }

    /// The text of a rank-0 string array.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Strings(s) => s.as_scalar(),
            _ => None,
        }
    }
}

impl From<Action> for Message {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}
