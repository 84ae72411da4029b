use std::process;

use anyhow::Context;
use tracing::info;
use varbridge::{Endpoints, Mode, Session, SessionConfig};
use varbridge_host::console::{self, Console};
use varbridge_host::{MemoryTable, init_tracing};

struct Options {
    endpoints: Vec<String>,
    interactive: bool,
    console: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: varbridge-peer [--interactive] [--no-console] [<in-fd> <out-fd>]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <in-fd> <out-fd>  Descriptors of the inbound and outbound streams");
            eprintln!("                    [default: $VARBRIDGE_FDS as \"<in>,<out>\"]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --interactive     Start in interactive mode [default: $VARBRIDGE_MODE]");
            eprintln!("  --no-console      Do not read console lines from stdin");
            eprintln!();
            eprintln!("Without endpoints no session is started and stdin is a local console.");
            eprintln!("The peer can switch modes by executing `interactive()` or `service()`.");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        endpoints: Vec::new(),
        interactive: false,
        console: true,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--interactive" => options.interactive = true,
            "--no-console" => options.console = false,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') && arg.parse::<i64>().is_err() => {
                return Err(format!("unknown flag: {arg}"));
            }
            arg => {
                if options.endpoints.len() == 2 {
                    return Err(format!("unexpected argument: {arg}"));
                }
                options.endpoints.push(arg.to_string());
            }
        }
        i += 1;
    }
    Ok(options)
}

async fn run(options: Options) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "varbridge-peer starting");

    let mut table = MemoryTable::with_prelude();

    let Some(endpoints) = Endpoints::resolve(&options.endpoints) else {
        info!("No stream endpoints, running without a session");
        return Console::stdio().run_detached(&mut table).await;
    };

    let mut config = SessionConfig::from_env();
    if options.interactive {
        config = config.with_mode(Mode::Interactive);
    }

    // A console on stdin would compete with a protocol stream on descriptor 0.
    let console_allowed = options.console && endpoints.inbound != 0;
    info!(
        inbound = endpoints.inbound,
        outbound = endpoints.outbound,
        console = console_allowed,
        "Opening stream endpoints"
    );
    let (inbound, outbound) = endpoints.open().context("opening stream endpoints")?;
    let mut session = Session::open(inbound, outbound, config);
    table.define_mode_control(session.mode_switch());

    let mut stdio = console_allowed.then(Console::stdio);
    console::drive(&mut session, &mut table, stdio.as_mut()).await?;

    info!("Session ended");
    Ok(())
}
