//! Line console.
//!
//! Plain lines run against the local table. Lines starting with `:` are commands:
//!
//! ```text
//! :get NAME     read a peer variable (no NAME claims the peer's held result)
//! :eval TEXT    evaluate TEXT on the peer
//! :service      hand the session back to the service loop
//! :status       session state as JSON
//! :quit         shut the session down and exit
//! ```

use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};
use varbridge::{Action, Mode, Name, Peer, Reply, RunExit, Session, Step, SymbolTable, Value};

use crate::eval;
use crate::table::MemoryTable;

const MAX_LINE_BYTES: usize = 64 * 1024;

const HELP: &str = "\
commands:
  :get NAME   read NAME from the peer (no NAME claims its held result)
  :eval TEXT  evaluate TEXT on the peer
  :service    return to the service loop
  :status     show session state
  :quit       shut down and exit
anything else is evaluated locally";

/// What the caller should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// Nothing arrived within the wait window.
    Pending,
    Eof,
}

pub struct Console<R, W> {
    lines: FramedRead<R, LinesCodec>,
    out: W,
}

impl Console<tokio::io::Stdin, tokio::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> Console<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            lines: FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            out: output,
        }
    }

    /// Next input line, waiting at most `window` if one is given.
    pub async fn read_line(&mut self, window: Option<Duration>) -> anyhow::Result<Line> {
        let next = match window {
            Some(window) => match tokio::time::timeout(window, self.lines.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(Line::Pending),
            },
            None => self.lines.next().await,
        };
        match next {
            Some(line) => Ok(Line::Text(line.context("reading console input")?)),
            None => Ok(Line::Eof),
        }
    }

    /// Run one line.
    pub async fn handle(
        &mut self,
        line: &str,
        session: Option<&mut Session>,
        table: &mut MemoryTable,
    ) -> anyhow::Result<Flow> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let Some(command) = line.strip_prefix(':') else {
            self.run_local(line, session, table).await?;
            return Ok(Flow::Continue);
        };
        let (command, rest) = command
            .split_once(char::is_whitespace)
            .map(|(c, r)| (c, r.trim()))
            .unwrap_or((command, ""));

        match command {
            "quit" | "q" => {
                if let Some(session) = session.filter(|s| !s.is_closed()) {
                    session.shutdown().await.context("shutting down session")?;
                }
                return Ok(Flow::Quit);
            }
            "service" => match session {
                Some(session) => {
                    session.mode_switch().request(Mode::Service);
                    self.say("switching to service mode").await?;
                }
                None => self.say("no session").await?,
            },
            "get" => {
                let action = Action::GetVar(Name::literal(rest));
                self.request(session, table, action).await?;
            }
            "eval" if rest.is_empty() => self.say("usage: :eval TEXT").await?,
            "eval" => {
                let action = Action::Evaluate(rest.to_string());
                self.request(session, table, action).await?;
            }
            "status" => {
                let status = match session {
                    Some(session) => serde_json::json!({
                        "state": session.state(),
                        "mode": session.mode(),
                        "held_references": session.refs().len(),
                        "consecutive_errors": session.consecutive_errors(),
                        "variables": table.len(),
                    }),
                    None => serde_json::json!({
                        "state": null,
                        "variables": table.len(),
                    }),
                };
                self.say(status.to_string()).await?;
            }
            "help" | "h" => self.say(HELP).await?,
            other => self.say(format!("unknown command :{other} (try :help)")).await?,
        }
        Ok(Flow::Continue)
    }

    /// Read and run lines until EOF or `:quit`, with no session.
    pub async fn run_detached(&mut self, table: &mut MemoryTable) -> anyhow::Result<()> {
        loop {
            match self.read_line(None).await? {
                Line::Text(text) => {
                    if self.handle(&text, None, table).await? == Flow::Quit {
                        return Ok(());
                    }
                }
                Line::Pending => {}
                Line::Eof => return Ok(()),
            }
        }
    }

    async fn run_local(
        &mut self,
        line: &str,
        session: Option<&mut Session>,
        table: &mut MemoryTable,
    ) -> anyhow::Result<()> {
        let mut peer = match session {
            Some(session) => session.peer(),
            None => Peer::detached(),
        };
        match table.evaluate(line, &mut peer).await {
            Ok(Value::Nil) => Ok(()),
            Ok(value) => self.say(value.to_string()).await,
            Err(e) => self.say(format!("error: {e}")).await,
        }
    }

    async fn request(
        &mut self,
        session: Option<&mut Session>,
        table: &mut MemoryTable,
        action: Action,
    ) -> anyhow::Result<()> {
        let Some(session) = session else {
            return self.say("no session").await;
        };
        match session.request(action, table).await {
            Ok(reply) => self.say(render_reply(reply)).await,
            Err(e) => self.say(format!("error: {e}")).await,
        }
    }

    async fn say(&mut self, text: impl AsRef<str>) -> anyhow::Result<()> {
        self.out.write_all(text.as_ref().as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}

fn render_reply(reply: Reply) -> String {
    match reply {
        Reply::Value(message) => match eval::remote_value(message) {
            Ok(value) => value.to_string(),
            Err(e) => format!("error: {e}"),
        },
        Reply::Empty => "ok".to_string(),
        Reply::Failed(reason) => format!("error: {reason}"),
        Reply::Unencodable => "result has no wire form; `:get` claims it".to_string(),
    }
}

/// Drive `session` until it ends, switching between the service loop and
/// interactive polling as its mode changes.
///
/// In Interactive mode each turn serves at most one peer request and then reads at
/// most one console line, each bounded by the poll interval.
pub async fn drive<R, W>(
    session: &mut Session,
    table: &mut MemoryTable,
    mut console: Option<&mut Console<R, W>>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        if session.is_closed() {
            return Ok(());
        }
        match session.mode() {
            Mode::Service => match session.run(table).await? {
                RunExit::Interactive => info!("Entering interactive mode"),
                RunExit::PeerClosed => {
                    info!("Peer closed its stream");
                    return Ok(());
                }
                RunExit::PeerShutdown => {
                    info!("Peer shut the session down");
                    return Ok(());
                }
            },
            Mode::Interactive => {
                match session.poll(table).await? {
                    Step::Closed | Step::PeerShutdown => return Ok(()),
                    Step::Idle | Step::Served => {}
                }
                let Some(input) = console.as_deref_mut() else {
                    continue;
                };
                let window = session.config().poll_interval;
                match input.read_line(Some(window)).await? {
                    Line::Pending => {}
                    Line::Eof => {
                        debug!("Console input closed");
                        console = None;
                    }
                    Line::Text(text) => {
                        if input.handle(&text, Some(&mut *session), table).await? == Flow::Quit {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_lines(input: &str, table: &mut MemoryTable) -> String {
        let (mut feed, console_in) = tokio::io::duplex(4096);
        let (console_out, mut output) = tokio::io::duplex(4096);
        feed.write_all(input.as_bytes()).await.unwrap();
        drop(feed);

        let mut console = Console::new(console_in, console_out);
        console.run_detached(table).await.unwrap();
        drop(console);

        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut output, &mut text)
            .await
            .unwrap();
        text
    }

    #[tokio::test]
    async fn detached_console_evaluates_locally() {
        let mut table = MemoryTable::with_prelude();
        let out = run_lines("x = [1, 2]\nsum(x, 3)\n\n1 / 0\n", &mut table).await;
        assert_eq!(out, "6\nerror: division by zero\n");
        assert_eq!(table.get("x").unwrap(), Value::ints(vec![1, 2]));
    }

    #[tokio::test]
    async fn detached_console_commands() {
        let mut table = MemoryTable::new();
        let out = run_lines(":get x\n:eval\n:service\n:bogus\n:quit\n1+1\n", &mut table).await;
        assert_eq!(
            out,
            "no session\nusage: :eval TEXT\nno session\nunknown command :bogus (try :help)\n"
        );
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let out = run_lines(":help\n", &mut MemoryTable::new()).await;
        insta::assert_snapshot!(out, @r"
commands:
  :get NAME   read NAME from the peer (no NAME claims its held result)
  :eval TEXT  evaluate TEXT on the peer
  :service    return to the service loop
  :status     show session state
  :quit       shut down and exit
anything else is evaluated locally
");
    }

    #[tokio::test]
    async fn status_without_session() {
        let mut table = MemoryTable::with_prelude();
        let out = run_lines(":status\n", &mut table).await;
        let status: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(status["state"], serde_json::Value::Null);
        assert_eq!(status["variables"], 2);
    }

    #[tokio::test]
    async fn read_line_times_out() {
        let (_feed, console_in) = tokio::io::duplex(64);
        let mut console = Console::new(console_in, tokio::io::sink());
        let line = console
            .read_line(Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(line, Line::Pending);
    }

    #[test]
    fn replies_render_for_people() {
        assert_eq!(render_reply(Reply::Empty), "ok");
        assert_eq!(
            render_reply(Reply::Value(varbridge::Message::int(2))),
            "2"
        );
        assert_eq!(render_reply(Reply::Failed("boom".into())), "error: boom");
        assert_eq!(
            render_reply(Reply::Value(varbridge::Message::Reference(
                varbridge::Handle::from_wire(3).unwrap()
            ))),
            "<remote reference>"
        );
    }
}
