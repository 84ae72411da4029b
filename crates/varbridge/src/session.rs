//! Session engine: owns both streams and drives the request/response cycle.
//!
//! Exactly one request is in flight per direction. A response is one optional value
//! message followed by an EOL whose flag carries the status:
//!
//! - `EOL(0)`: success
//! - `EOL(1)`: failure, preceded by a scalar string describing it
//! - `EOL(2)`: the result has no wire form and is held as the pending reference
//! - `EOL(-1)`: the sender is terminating the session
//!
//! Recoverable failures are answered with `EOL(1)` and the session stays open. Fatal
//! failures (framing, I/O) close both streams; the peer sees EOF. Consecutive
//! recoverable failures are counted and past [`SessionConfig::error_loop_bound`] the
//! next one is fatal too.
//!
//! While the local side waits for a reply to its own request, the peer may send
//! requests of its own. Those are served in place, to any depth, before the wait
//! resumes.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::{Action, EolFlag, Message};
use crate::config::SessionConfig;
use crate::dispatch::{Outcome, Peer, SymbolTable, dispatch};
use crate::error::{BridgeError, Result};
use crate::refs::ReferenceTable;
use crate::state::{Mode, ModeSwitch, SessionState};
use crate::value::Value;

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, MessageCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MessageCodec>;

/// Reply to a request this side sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Message),
    /// Success without a value.
    Empty,
    /// The peer reported a failure.
    Failed(String),
    /// The result stayed on the peer as its pending reference.
    Unencodable,
}

/// Result of one Idle cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing arrived within the poll window.
    Idle,
    /// One message was read and answered.
    Served,
    /// The inbound stream ended at a message boundary.
    Closed,
    /// The peer sent the shutdown marker; it has been acknowledged.
    PeerShutdown,
}

/// Why [`Session::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Mode switched to Interactive; drive the session with [`Session::poll`].
    Interactive,
    PeerClosed,
    PeerShutdown,
}

pub struct Session {
    reader: Option<Reader>,
    writer: Option<Writer>,
    refs: ReferenceTable<Value>,
    config: SessionConfig,
    mode: Mode,
    mode_switch: ModeSwitch,
    state: SessionState,
    /// Set once the peer's shutdown marker has been acknowledged.
    peer_shutdown: bool,
    /// Received requests not yet answered (nested requests stack).
    owed: usize,
    error_loop: u32,
}

impl Session {
    pub fn open<R, W>(inbound: R, outbound: W, config: SessionConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inbound: Box<dyn AsyncRead + Send + Unpin> = Box::new(inbound);
        let outbound: Box<dyn AsyncWrite + Send + Unpin> = Box::new(outbound);
        tracing::info!(mode = ?config.mode, "Opening session");
        Self {
            reader: Some(FramedRead::new(inbound, config.codec())),
            writer: Some(FramedWrite::new(outbound, config.codec())),
            refs: ReferenceTable::new(config.max_handles),
            mode: config.mode,
            mode_switch: ModeSwitch::new(),
            state: SessionState::Idle,
            peer_shutdown: false,
            owed: 0,
            error_loop: 0,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Handle for requesting a mode change from elsewhere.
    pub fn mode_switch(&self) -> ModeSwitch {
        self.mode_switch.clone()
    }

    /// True while a received request is unanswered.
    pub fn response_owed(&self) -> bool {
        self.owed > 0
    }

    pub fn owed_depth(&self) -> usize {
        self.owed
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.error_loop
    }

    pub fn refs(&self) -> &ReferenceTable<Value> {
        &self.refs
    }

    pub fn refs_mut(&mut self) -> &mut ReferenceTable<Value> {
        &mut self.refs
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Requester handle for issuing requests from host code.
    pub fn peer(&mut self) -> Peer<'_> {
        Peer::new(self)
    }

    /// Serve requests until the mode becomes Interactive or the session ends.
    pub async fn run(&mut self, table: &mut dyn SymbolTable) -> Result<RunExit> {
        loop {
            self.apply_mode_switch();
            if self.mode == Mode::Interactive {
                tracing::debug!("Leaving service loop for interactive mode");
                return Ok(RunExit::Interactive);
            }
            match self.cycle(table, None).await? {
                Step::Idle | Step::Served => {}
                Step::Closed => return Ok(RunExit::PeerClosed),
                Step::PeerShutdown => return Ok(RunExit::PeerShutdown),
            }
        }
    }

    /// One Interactive cycle: wait up to the poll interval for a request and serve it.
    pub async fn poll(&mut self, table: &mut dyn SymbolTable) -> Result<Step> {
        self.apply_mode_switch();
        let window = self.config.poll_interval;
        self.cycle(table, Some(window)).await
    }

    /// Send a request and wait for its reply.
    ///
    /// Requests the peer sends meanwhile are served against `table` before the wait
    /// resumes, so the two sides can call into each other to any depth.
    pub fn request<'s>(
        &'s mut self,
        action: Action,
        table: &'s mut dyn SymbolTable,
    ) -> BoxFuture<'s, Result<Reply>> {
        Box::pin(async move {
            self.ensure_open()?;
            let saved = self.state;
            tracing::debug!(request = action.label(), depth = self.owed, "Sending request");
            self.send(vec![Message::Action(action)]).await?;

            let mut value: Option<Message> = None;
            loop {
                self.state = SessionState::AwaitingRequest;
                match self.read().await? {
                    Message::Action(nested) => {
                        tracing::debug!(request = nested.label(), "Serving nested request");
                        self.serve(nested, table).await?;
                    }
                    Message::Eol(EolFlag::Shutdown) => {
                        self.acknowledge_shutdown().await?;
                        return Err(BridgeError::PeerShutdown);
                    }
                    Message::Eol(flag) => {
                        self.state = saved;
                        return self.finish_reply(flag, value);
                    }
                    passive if value.is_none() => value = Some(passive),
                    extra => {
                        return Err(self.fail(BridgeError::violation(format!(
                            "second {} value in one reply",
                            extra.label()
                        ))));
                    }
                }
            }
        })
    }

    /// Send the shutdown marker, wait for the acknowledgement, and close.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.ensure_open()?;
        tracing::info!("Shutting down session");
        self.send(vec![Message::Eol(EolFlag::Shutdown)]).await?;

        loop {
            let next = match self.reader.as_mut() {
                Some(reader) => reader.next().await,
                None => return Err(BridgeError::SessionClosed),
            };
            match next {
                Some(Ok(Message::Eol(EolFlag::Shutdown))) | None => break,
                Some(Ok(Message::Action(action))) => {
                    tracing::debug!(request = action.label(), "Refusing request during shutdown");
                    self.send(vec![
                        Message::string("session is shutting down"),
                        Message::Eol(EolFlag::Error),
                    ])
                    .await?;
                }
                Some(Ok(other)) => {
                    tracing::debug!(message = other.label(), "Dropping message during shutdown");
                }
                Some(Err(e)) => return Err(self.fail(e)),
            }
        }
        self.close();
        Ok(())
    }

    /// Release both streams. Further calls fail with `SessionClosed`.
    pub fn close(&mut self) {
        let reader = self.reader.take();
        let writer = self.writer.take();
        if reader.is_some() || writer.is_some() {
            tracing::debug!("Session closed");
        }
        self.state = SessionState::Closed;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(())
    }

    fn apply_mode_switch(&mut self) {
        if let Some(mode) = self.mode_switch.take() {
            if mode != self.mode {
                tracing::info!(from = ?self.mode, to = ?mode, "Switching mode");
            }
            self.mode = mode;
        }
    }

    /// Close on a fatal error and hand the error back.
    fn fail(&mut self, err: BridgeError) -> BridgeError {
        tracing::error!(error = %err, state = ?self.state, "Fatal session error, closing streams");
        self.close();
        err
    }

    async fn cycle(&mut self, table: &mut dyn SymbolTable, window: Option<Duration>) -> Result<Step> {
        self.ensure_open()?;
        self.state = SessionState::AwaitingRequest;

        let reader = self.reader.as_mut().ok_or(BridgeError::SessionClosed)?;
        let next = match window {
            None => reader.next().await,
            Some(window) => match tokio::time::timeout(window, reader.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.state = SessionState::Idle;
                    return Ok(Step::Idle);
                }
            },
        };

        match next {
            None => {
                tracing::info!("Inbound stream closed");
                self.close();
                Ok(Step::Closed)
            }
            Some(Err(e)) => Err(self.fail(e)),
            Some(Ok(Message::Action(action))) => match self.serve(action, table).await {
                Ok(()) => Ok(Step::Served),
                // Shutdown arrived while the request was waiting on a nested reply.
                Err(BridgeError::PeerShutdown) => Ok(Step::PeerShutdown),
                Err(e) => Err(e),
            },
            Some(Ok(Message::Eol(EolFlag::Shutdown))) => {
                self.acknowledge_shutdown().await?;
                Ok(Step::PeerShutdown)
            }
            Some(Ok(other)) => {
                self.report(BridgeError::violation(format!(
                    "{} message where a request was expected",
                    other.label()
                )))
                .await?;
                self.state = SessionState::Idle;
                Ok(Step::Served)
            }
        }
    }

    /// Dispatch one received request and write its response.
    fn serve<'s>(
        &'s mut self,
        action: Action,
        table: &'s mut dyn SymbolTable,
    ) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            let resume = self.state;
            self.owed += 1;
            self.state = SessionState::Dispatching;
            let label = action.label();
            tracing::debug!(request = label, depth = self.owed, "Dispatching request");

            let outcome = dispatch(self, table, action).await;
            if self.peer_shutdown {
                tracing::debug!(request = label, "Peer shut down before the response was sent");
                return Err(BridgeError::PeerShutdown);
            }
            self.ensure_open()?;
            self.state = SessionState::AwaitingResponseSend;

            let sent = match outcome {
                Ok(outcome) => self.respond(outcome).await,
                Err(err) if err.is_fatal() => Err(self.fail(err)),
                Err(err) => self.report(err).await,
            };
            sent?;

            self.owed -= 1;
            self.state = if self.owed == 0 {
                SessionState::Idle
            } else {
                resume
            };
            tracing::debug!(request = label, "Response sent");
            Ok(())
        })
    }

    async fn respond(&mut self, outcome: Outcome) -> Result<()> {
        let body = match outcome {
            Outcome::Done => vec![Message::Eol(EolFlag::Ok)],
            Outcome::Reference(handle) => vec![Message::Reference(handle), Message::Eol(EolFlag::Ok)],
            Outcome::Value(value) => match value.to_message() {
                Some(message) => vec![message, Message::Eol(EolFlag::Ok)],
                None => match self.refs.hold_pending(value) {
                    Ok(handle) => {
                        tracing::debug!(%handle, "Result has no wire form, held as pending");
                        vec![Message::Eol(EolFlag::Unencodable)]
                    }
                    Err(e) => return self.report(e.into()).await,
                },
            },
        };
        self.send(body).await?;
        self.error_loop = 0;
        Ok(())
    }

    /// Answer the current request with `EOL(1)`.
    async fn report(&mut self, err: BridgeError) -> Result<()> {
        self.error_loop += 1;
        if self.error_loop > self.config.error_loop_bound {
            let count = self.error_loop;
            tracing::warn!(error = %err, "Error loop bound exceeded");
            return Err(self.fail(BridgeError::ErrorLoop(count)));
        }
        tracing::warn!(error = %err, consecutive = self.error_loop, "Request failed");
        self.send(vec![Message::string(err.to_string()), Message::Eol(EolFlag::Error)])
            .await
    }

    async fn acknowledge_shutdown(&mut self) -> Result<()> {
        tracing::info!("Peer is shutting down, acknowledging");
        self.send(vec![Message::Eol(EolFlag::Shutdown)]).await?;
        self.peer_shutdown = true;
        self.close();
        Ok(())
    }

    fn finish_reply(&mut self, flag: EolFlag, value: Option<Message>) -> Result<Reply> {
        Ok(match (flag, value) {
            (EolFlag::Ok, Some(value)) => Reply::Value(value),
            (EolFlag::Ok, None) => Reply::Empty,
            (EolFlag::Error, description) => Reply::Failed(
                description
                    .as_ref()
                    .and_then(Message::as_str)
                    .unwrap_or("peer reported an error")
                    .to_string(),
            ),
            (EolFlag::Unencodable, None) => Reply::Unencodable,
            (EolFlag::Unencodable, Some(value)) => {
                return Err(self.fail(BridgeError::violation(format!(
                    "{} value before EOL(2)",
                    value.label()
                ))));
            }
            (EolFlag::Shutdown, _) => return Err(BridgeError::PeerShutdown),
        })
    }

    /// Write a whole response; the frames are flushed together.
    async fn send(&mut self, messages: Vec<Message>) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::SessionClosed)?;
        let mut result = Ok(());
        for message in messages {
            result = writer.feed(message).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }
        result.map_err(|e| self.fail(e))
    }

    /// Next whole message. End of stream while one is awaited is fatal.
    async fn read(&mut self) -> Result<Message> {
        let reader = self.reader.as_mut().ok_or(BridgeError::SessionClosed)?;
        match reader.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(self.fail(e)),
            None => Err(self.fail(BridgeError::PeerClosed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::bridge::protocol::Name;
    use crate::dispatch::{CallArgs, Target};
    use crate::error::EvalError;
    use crate::value::Opaque;

    /// Variables only; evaluation looks a name up, execution ignores its text.
    #[derive(Default)]
    struct Vars(Vec<(String, Value)>);

    #[async_trait::async_trait]
    impl SymbolTable for Vars {
        fn get(&self, name: &str) -> std::result::Result<Value, EvalError> {
            self.0
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| EvalError::NotFound(name.to_string()))
        }

        fn set(&mut self, name: &str, value: Value) -> std::result::Result<(), EvalError> {
            self.0.retain(|(k, _)| k != name);
            self.0.push((name.to_string(), value));
            Ok(())
        }

        async fn call(
            &mut self,
            target: &Target,
            _args: CallArgs,
            _expect_result: bool,
            _peer: &mut Peer<'_>,
        ) -> std::result::Result<Option<Value>, EvalError> {
            Err(EvalError::NotCallable(target.to_string()))
        }

        async fn evaluate(
            &mut self,
            text: &str,
            peer: &mut Peer<'_>,
        ) -> std::result::Result<Value, EvalError> {
            if let Some(remote) = text.strip_prefix("remote:") {
                return match peer.request(Action::GetVar(Name::literal(remote)), self).await {
                    Ok(Reply::Value(Message::Array(a))) => Ok(Value::Array(a)),
                    Ok(other) => Err(EvalError::Remote(format!("{other:?}"))),
                    Err(e) => Err(EvalError::Remote(e.to_string())),
                };
            }
            self.get(text)
        }

        async fn execute(
            &mut self,
            _text: &str,
            _peer: &mut Peer<'_>,
        ) -> std::result::Result<(), EvalError> {
            Ok(())
        }
    }

    struct Remote {
        reader: FramedRead<DuplexStream, MessageCodec>,
        writer: FramedWrite<DuplexStream, MessageCodec>,
    }

    impl Remote {
        async fn send(&mut self, message: Message) {
            self.writer.send(message).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            self.reader.next().await.unwrap().unwrap()
        }
    }

    fn pair(config: SessionConfig) -> (Session, Remote) {
        let (local_in, remote_out) = duplex(64 * 1024);
        let (remote_in, local_out) = duplex(64 * 1024);
        let session = Session::open(local_in, local_out, config);
        let remote = Remote {
            reader: FramedRead::new(remote_in, MessageCodec::new()),
            writer: FramedWrite::new(remote_out, MessageCodec::new()),
        };
        (session, remote)
    }

    #[tokio::test]
    async fn get_var_answers_value_then_eol() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        table.set("x", Value::int(7)).unwrap();

        remote.send(Action::GetVar(Name::literal("x")).into()).await;
        assert_eq!(session.poll(&mut table).await.unwrap(), Step::Served);
        assert_eq!(remote.recv().await, Message::int(7));
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.response_owed());
    }

    #[tokio::test]
    async fn recoverable_error_reports_eol_one() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        remote.send(Action::GetVar(Name::literal("missing")).into()).await;
        session.poll(&mut table).await.unwrap();
        assert_eq!(
            remote.recv().await,
            Message::string("variable not found: missing")
        );
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Error));
        assert_eq!(session.consecutive_errors(), 1);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn poll_times_out_idle() {
        let config = SessionConfig::default().with_poll_interval(Duration::from_millis(5));
        let (mut session, _remote) = pair(config);
        let mut table = Vars::default();
        assert_eq!(session.poll(&mut table).await.unwrap(), Step::Idle);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn passive_message_at_idle_is_a_violation() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        remote.send(Message::int(1)).await;
        session.poll(&mut table).await.unwrap();
        let description = remote.recv().await;
        assert!(description.as_str().unwrap().starts_with("protocol violation"));
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Error));
    }

    #[tokio::test]
    async fn error_loop_bound_escalates_to_fatal() {
        let config = SessionConfig::default().with_error_loop_bound(2);
        let (mut session, mut remote) = pair(config);
        let mut table = Vars::default();

        for _ in 0..2 {
            remote.send(Action::GetVar(Name::literal("nope")).into()).await;
            session.poll(&mut table).await.unwrap();
            remote.recv().await;
            assert_eq!(remote.recv().await, Message::Eol(EolFlag::Error));
        }
        remote.send(Action::GetVar(Name::literal("nope")).into()).await;
        let err = session.poll(&mut table).await.unwrap_err();
        assert!(matches!(err, BridgeError::ErrorLoop(3)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn success_resets_error_loop() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        table.set("x", Value::int(1)).unwrap();

        remote.send(Action::GetVar(Name::literal("nope")).into()).await;
        session.poll(&mut table).await.unwrap();
        remote.send(Action::GetVar(Name::literal("x")).into()).await;
        session.poll(&mut table).await.unwrap();
        assert_eq!(session.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn unencodable_result_becomes_pending_reference() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        let callable = Value::Opaque(Opaque::new("function", ()));
        table.set("f", callable.clone()).unwrap();

        remote.send(Action::GetVar(Name::literal("f")).into()).await;
        session.poll(&mut table).await.unwrap();
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Unencodable));

        remote.send(Action::GetVar(Name::literal("")).into()).await;
        session.poll(&mut table).await.unwrap();
        let Message::Reference(handle) = remote.recv().await else {
            panic!("expected reference");
        };
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));
        assert_eq!(session.refs().resolve(handle).unwrap(), &callable);

        // Reference-named GetVar of an unencodable value answers with the same handle.
        remote.send(Action::GetVar(Name::Reference(handle)).into()).await;
        session.poll(&mut table).await.unwrap();
        assert_eq!(remote.recv().await, Message::Reference(handle));
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));

        remote.send(Action::Release(handle).into()).await;
        session.poll(&mut table).await.unwrap();
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));
        assert!(session.refs().is_empty());

        // Releasing again is a reported misuse, not a corruption.
        remote.send(Action::Release(handle).into()).await;
        session.poll(&mut table).await.unwrap();
        remote.recv().await;
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Error));
    }

    #[tokio::test]
    async fn malformed_frame_closes_session() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        let mut raw = BytesMut::new();
        for word in [3i32, 1, 0] {
            raw.put_i32_le(word);
        }
        remote.writer.get_mut().write_all(&raw).await.unwrap();

        let err = session.poll(&mut table).await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedFrame(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.poll(&mut table).await,
            Err(BridgeError::SessionClosed)
        ));
        // Our outbound side is gone: the peer sees EOF.
        assert!(remote.reader.next().await.is_none());
    }

    #[tokio::test]
    async fn eof_at_idle_closes_normally() {
        let (mut session, remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        drop(remote);
        assert_eq!(session.run(&mut table).await.unwrap(), RunExit::PeerClosed);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn peer_shutdown_is_acknowledged() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        remote.send(Message::Eol(EolFlag::Shutdown)).await;
        assert_eq!(session.run(&mut table).await.unwrap(), RunExit::PeerShutdown);
        assert_eq!(remote.recv().await, Message::Eol(EolFlag::Shutdown));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn shutdown_during_nested_request_ends_the_run() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        remote.send(Action::Evaluate("remote:y".into()).into()).await;
        let remote_task = tokio::spawn(async move {
            assert_eq!(remote.recv().await, Action::GetVar(Name::literal("y")).into());
            // Shut down instead of answering.
            remote.send(Message::Eol(EolFlag::Shutdown)).await;
            assert_eq!(remote.recv().await, Message::Eol(EolFlag::Shutdown));
            assert!(remote.reader.next().await.is_none());
        });

        assert_eq!(session.run(&mut table).await.unwrap(), RunExit::PeerShutdown);
        assert!(session.is_closed());
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn mode_switch_applies_at_idle() {
        let (mut session, _remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        session.mode_switch().request(Mode::Interactive);
        assert_eq!(session.run(&mut table).await.unwrap(), RunExit::Interactive);
        assert_eq!(session.mode(), Mode::Interactive);
    }

    #[tokio::test]
    async fn request_serves_nested_requests_while_waiting() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();
        table.set("local", Value::int(5)).unwrap();

        let remote_task = tokio::spawn(async move {
            // The peer asks us something before answering our request.
            let Message::Action(Action::GetVar(Name::Literal(asked))) = remote.recv().await else {
                panic!("expected get_var");
            };
            assert_eq!(asked, "theirs");
            remote.send(Action::GetVar(Name::literal("local")).into()).await;
            assert_eq!(remote.recv().await, Message::int(5));
            assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));

            remote.send(Message::int(40)).await;
            remote.send(Message::Eol(EolFlag::Ok)).await;
            remote
        });

        let reply = session
            .request(Action::GetVar(Name::literal("theirs")), &mut table)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value(Message::int(40)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.response_owed());
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn evaluation_can_call_back_into_the_peer() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        remote.send(Action::Evaluate("remote:y".into()).into()).await;
        let remote_task = tokio::spawn(async move {
            let nested = remote.recv().await;
            assert_eq!(nested, Action::GetVar(Name::literal("y")).into());
            remote.send(Message::int(9)).await;
            remote.send(Message::Eol(EolFlag::Ok)).await;
            assert_eq!(remote.recv().await, Message::int(9));
            assert_eq!(remote.recv().await, Message::Eol(EolFlag::Ok));
        });

        assert_eq!(session.poll(&mut table).await.unwrap(), Step::Served);
        remote_task.await.unwrap();
        assert!(!session.response_owed());
    }

    #[tokio::test]
    async fn failed_reply_carries_description() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let mut table = Vars::default();

        let remote_task = tokio::spawn(async move {
            remote.recv().await;
            remote.send(Message::string("no such thing")).await;
            remote.send(Message::Eol(EolFlag::Error)).await;
            remote
        });
        let reply = session
            .request(Action::GetVar(Name::literal("q")), &mut table)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Failed("no such thing".into()));
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_handshake() {
        let (mut session, mut remote) = pair(SessionConfig::default());
        let remote_task = tokio::spawn(async move {
            assert_eq!(remote.recv().await, Message::Eol(EolFlag::Shutdown));
            remote.send(Message::Eol(EolFlag::Shutdown)).await;
        });
        session.shutdown().await.unwrap();
        assert!(session.is_closed());
        remote_task.await.unwrap();
    }
}
