//! varbridge: a two-pipe remote-control protocol between peer processes.
//!
//! One side exposes a symbol table of named values and callables; the other reads,
//! writes, calls and slices its entries over a pair of unidirectional byte streams.
//! Either side may issue requests, and requests may nest.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod refs;
pub mod session;
pub mod state;
pub mod value;

pub use bridge::codec::MessageCodec;
pub use bridge::protocol::{Action, Args, EolFlag, Message, Name};
pub use bridge::transport::Endpoints;
pub use bridge::types::{ArrayData, ElementType, NumericArray, RangeSpec, RangeStyle, StringArray};
pub use config::SessionConfig;
pub use dispatch::{CallArgs, Outcome, Peer, SymbolTable, Target};
pub use error::{BridgeError, EvalError, ReferenceError, Result, Severity};
pub use refs::{Handle, ReferenceTable};
pub use session::{Reply, RunExit, Session, Step};
pub use state::{Mode, ModeSwitch, SessionState};
pub use value::{Index, Opaque, Value};
