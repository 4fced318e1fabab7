use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use eventchain::prelude::*;
use eventchain::{ENGINE_NAME, VERSION as LIB_VERSION};
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Interactive shell for stepping through an Eventchain run.
#[derive(Parser)]
#[command(name = "chainshell", version, about)]
struct Args {
    /// TOML configuration file. The built-in graph is used when omitted.
    config: Option<PathBuf>,
}

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct MyHighlighter;

impl Highlighter for MyHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    const LOGO_TEXT: &str = include_str!("../logo.log");
    println!("{}", LOGO_TEXT.cyan());
    println!("{}", "-".repeat(64).dimmed());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!(
        "{}",
        "\n    This software is provided 'as is', without warranty of any kind.\n    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.\n"
            .dimmed()
    );
    println!("{}", "-".repeat(64).dimmed());
}

type ReferenceMediator = Mediator<TimeLedger, BuiltinHandler>;

/// The run the shell is stepping through.
struct Session {
    config: EngineConfig,
    mediator: ReferenceMediator,
}

impl Session {
    fn new(config: EngineConfig) -> Result<Self> {
        let mediator = reference_mediator(EngineContext::new(config.clone()))?;
        Ok(Self { config, mediator })
    }

    fn step(&mut self, count: u64) -> Result<()> {
        for _ in 0..count {
            match self.mediator.step()? {
                StepOutcome::Committed { tag, time } => {
                    println!("--> {} at {}", self.mediator.graph().name(tag).green(), time);
                }
                StepOutcome::Terminated(reason) => {
                    println!("--> Run terminated: {:?}", reason);
                    break;
                }
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let summary = self.mediator.run()?;
        println!(
            "--> {:?} after {} commits at {}",
            summary.reason, summary.commits, summary.final_time
        );
        Ok(())
    }

    fn peek(&mut self) -> Result<()> {
        match self.mediator.peek()? {
            Some((tag, time)) => println!("--> Next: {} at {}", tag.green(), time),
            None => println!("--> Nothing is pending."),
        }
        Ok(())
    }

    fn stats(&self) {
        let stats = self.mediator.stats();
        let ledger = self.mediator.state();
        println!("State:       {:?}", stats.state);
        println!("Time:        {}", stats.current_time);
        println!("Commits:     {}", stats.commits);
        println!("Pending:     {} ({} stored)", stats.pending, stats.stored);
        println!("Instances:   {}", stats.instances);
        println!(
            "Ledger:      active unit {} of {}, {} lifts, {} samples",
            ledger.active(),
            ledger.units(),
            ledger.lifts,
            ledger.samples
        );
        for (tag, commits) in stats.per_tag {
            println!("  {:<16} {}", tag, commits);
        }
    }

    fn dump(&self, path: &str) -> Result<()> {
        self.mediator.snapshot().save(path)?;
        println!("--> Snapshot written to {}", path);
        Ok(())
    }

    /// Replaces the run with one resumed from a snapshot file.
    fn load(&mut self, path: &str) -> Result<()> {
        let snapshot = Snapshot::load(path)?;
        let context = EngineContext::resumed(self.config.clone(), snapshot.run_id);
        let mut mediator = reference_mediator(context)?;
        mediator
            .restore(&snapshot)
            .with_context(|| format!("restoring {path}"))?;
        self.mediator = mediator;
        println!(
            "--> Resumed run {} at {} after {} commits",
            snapshot.run_id, snapshot.current_time, snapshot.commits
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        *self = Session::new(self.config.clone())?;
        println!("--> Fresh run {}", self.mediator.context().run_id());
        Ok(())
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  step [N]        - Commits the next N events (default 1).");
    println!("  run             - Runs until the end tag commits.");
    println!("  peek            - Shows the next event without committing it.");
    println!("  stats           - Shows run and ledger counters.");
    println!("  dump <FILE>     - Writes a snapshot of the run.");
    println!("  load <FILE>     - Resumes from a snapshot file.");
    println!("  reset           - Starts a fresh run.");
    println!("  exit            - Quits the shell.");
}

fn dispatch(session: &mut Session, args: &[&str]) -> Result<bool> {
    let Some(command) = args.first() else {
        return Ok(true);
    };
    match *command {
        "step" => {
            let count = match args.get(1) {
                Some(value) => value
                    .parse::<u64>()
                    .with_context(|| format!("'{value}' is not a valid step count"))?,
                None => 1,
            };
            session.step(count)?;
        }
        "run" => session.run()?,
        "peek" => session.peek()?,
        "stats" => session.stats(),
        "dump" => match args.get(1) {
            Some(path) => session.dump(path)?,
            None => println!("Usage: dump <FILE>"),
        },
        "load" => match args.get(1) {
            Some(path) => session.load(path)?,
            None => println!("Usage: load <FILE>"),
        },
        "reset" => session.reset()?,
        "help" => print_help(),
        "exit" => return Ok(false),
        other => println!("Unknown command: '{}'. Type 'help'.", other),
    }
    Ok(true)
}

fn main() -> Result<()> {
    let cli = Args::parse();
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut session = Session::new(config)?;
    info!(run_id = %session.mediator.context().run_id(), "session ready");

    let mut rl = Editor::new()?;
    rl.set_helper(Some(MyHighlighter));

    println!("{} is ready. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                match dispatch(&mut session, &args) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("{} {:#}", "Error:".red().bold(), e),
                }
            }
            Err(_) => {
                println!("Exiting chainshell...");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_optional() {
        assert!(Args::try_parse_from(["chainshell"]).unwrap().config.is_none());
        let args = Args::try_parse_from(["chainshell", "run.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("run.toml")));
        assert!(Args::try_parse_from(["chainshell", "a.toml", "b.toml"]).is_err());
    }
}
