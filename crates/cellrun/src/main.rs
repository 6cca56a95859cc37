//! cellrun CLI entry point.
//!
//! Launches a local Jupyter kernel, runs code through a `kernel_session::Session`
//! and prints the resulting events.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kernel_session::{ContentType, ExecutionEvent, MsgType, Session, SessionConfig};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "cellrun", author, version)]
#[command(about = "Run code cells against a local Jupyter kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    kernel: KernelArgs,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Args, Debug)]
struct KernelArgs {
    /// Python interpreter with ipykernel installed (default: $CELLRUN_PYTHON, then python3)
    #[arg(long, global = true)]
    python: Option<PathBuf>,

    /// Launch an installed kernelspec (e.g. python3, deno) instead of a Python interpreter
    #[arg(long, global = true)]
    kernel: Option<String>,

    /// Per-cell timeout in milliseconds (default: $CELLRUN_TIMEOUT_MS, else none)
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

impl KernelArgs {
    fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env();
        if let Some(python) = &self.python {
            config = config.python(python);
        }
        if let Some(kernel) = &self.kernel {
            config = config.kernelspec(kernel);
        }
        if let Some(ms) = self.timeout {
            config = config.timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[derive(Args, Debug)]
struct CellArgs {
    /// The code to execute (reads --file or stdin if not provided)
    code: Option<String>,

    /// Read the code from a file
    #[arg(long, short, conflicts_with = "code")]
    file: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

impl CellArgs {
    fn source(&self) -> Result<String> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }
        if let Some(path) = &self.file {
            return std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()));
        }
        let mut code = String::new();
        io::stdin().read_to_string(&mut code)?;
        Ok(code)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a cell to completion and print the aggregated result
    Run(CellArgs),
    /// Run a cell and print each event as it arrives
    Stream(CellArgs),
    /// Open an interactive console on a fresh kernel
    Console,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let session = Session::local(cli.kernel.config())?;
    info!("Kernel ready");

    let outcome = match &cli.command {
        Commands::Run(args) => run(&session, args),
        Commands::Stream(args) => stream(&session, args),
        Commands::Console => console(&session),
    };

    session.close()?;

    // A cell that raised is reported through the exit code.
    if outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Returns whether the cell raised.
fn run(session: &Session, args: &CellArgs) -> Result<bool> {
    let code = args.source()?;
    let result = session.run_cell(&code, None)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for event in &result.events {
            print_event(event);
        }
    }
    Ok(result.error)
}

fn stream(session: &Session, args: &CellArgs) -> Result<bool> {
    let code = args.source()?;
    let mut errored = false;

    for event in session.stream_cell(&code, None)? {
        let event = event?;
        errored |= event.is_error();
        if args.json {
            // One event per line so consumers can parse incrementally.
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        io::stdout().flush()?;
    }
    Ok(errored)
}

fn console(session: &Session) -> Result<bool> {
    println!("cellrun console");
    println!("Use Ctrl+D to exit, %restart to clear state.\n");

    let mut execution_count: u32 = 0;
    loop {
        execution_count += 1;
        print!("In [{}]: ", execution_count);
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            println!();
            break;
        }

        let code = line.trim();
        if code.is_empty() {
            execution_count -= 1;
            continue;
        }
        if code == "%restart" {
            session.restart()?;
            println!("Kernel restarted.\n");
            execution_count = 0;
            continue;
        }

        match session.stream_cell(code, None) {
            Ok(events) => {
                for event in events {
                    match event {
                        Ok(event) if event.msg_type() == MsgType::ExecuteResult => {
                            println!("Out[{}]: {}", execution_count, event.content());
                        }
                        Ok(event) => print_event(&event),
                        // Timeouts and callback failures end the cell, not the console.
                        Err(e) => {
                            eprintln!("{}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => eprintln!("{}", e),
        }
        println!();
    }
    Ok(false)
}

fn print_event(event: &ExecutionEvent) {
    match event.content_type() {
        ContentType::Console if event.is_error() => eprintln!("{}", event.content()),
        ContentType::Console if event.msg_type() == MsgType::Stream => {
            print!("{}", event.content())
        }
        ContentType::Console => println!("{}", event.content()),
        ContentType::Image => println!(
            "[{} image, {} bytes base64]",
            event.content_format(),
            event.content().len()
        ),
        ContentType::Code => println!("[{}]\n{}", event.content_format(), event.content()),
    }
}
