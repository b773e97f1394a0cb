//! Textual command dispatch: the surface the debugger host calls.
//!
//! The host hands over a command name and its raw argument string; the
//! front-end parses the arguments, probes the environment, constructs a
//! processor, drives the walker and renders. Success is silent beyond
//! the report; failures are printed to the console and control returns
//! to the prompt.

use std::io;
use std::path::Path;

use crate::env::{Mode, TargetEnv};
use crate::error::{self, Error};
use crate::heap::{WalkOptions, Walker};
use crate::processor::{BySizeProcessor, LineEnding, SummaryProcessor, UmdhProcessor};
use crate::target::Target;
use crate::ust;

/// Dispatch one command. `args` is the space-separated argument string
/// the debugger passed through.
pub fn run<T: Target + ?Sized>(
    target: &T,
    command: &str,
    args: &str,
    console: &mut dyn io::Write,
) {
    let result = match command {
        "help" => {
            print_help(console);
            Ok(())
        }
        "heapstat" => heapstat(target, args, console),
        "bysize" => by_size(target, args, console),
        "umdh" => umdh(target, args, console),
        "ust" => ust_trace(target, args, console),
        other => Err(Error::Malformed(format!("unknown command: {other}"))),
    };
    if let Err(err) = result {
        dprintln!(console, "{}", err);
    }
}

fn print_help(console: &mut dyn io::Write) {
    dprintln!(console, "Commands of the heap analyzer");
    dprintln!(console, "   heapstat [-v] [-k <key>] - Show statistics of heaps");
    dprintln!(console, "   bysize [-v] [<size>]     - Show statistics per user requested size");
    dprintln!(console, "   umdh [-crlf] <file>      - Write statistics in UMDH format");
    dprintln!(console, "   ust <addr>               - Show the stack trace record at <addr>");
    dprintln!(console, "   help                     - Show this help");
}

fn heapstat<T: Target + ?Sized>(
    target: &T,
    args: &str,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let mut verbose = false;
    let mut key = None;
    let mut tokens = args.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-v" => verbose = true,
            "-k" => {
                key = Some(
                    tokens
                        .next()
                        .ok_or_else(|| Error::Malformed("usage: heapstat [-v] [-k <key>]".into()))?
                        .to_string(),
                );
            }
            other => {
                return Err(Error::Malformed(format!("heapstat: unexpected argument {other}")));
            }
        }
    }

    let env = TargetEnv::probe(target)?;
    match env.mode() {
        Mode::Hpa => dprintln!(console, "hpa enabled"),
        Mode::Ust => dprintln!(console, "ust enabled"),
        Mode::Plain => {}
    }
    let mut processor = match key {
        Some(key) => SummaryProcessor::with_key(&key),
        None => SummaryProcessor::new(),
    };
    let options = WalkOptions {
        verbose,
        ..WalkOptions::default()
    };
    Walker::with_options(target, env, options).walk(&mut processor, console)?;
    processor.print(target, &env, console);
    Ok(())
}

fn by_size<T: Target + ?Sized>(
    target: &T,
    args: &str,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let mut verbose = false;
    let mut filter = None;
    for token in args.split_whitespace() {
        match token {
            "-v" => verbose = true,
            other => filter = Some(parse_number(other)?),
        }
    }

    let env = TargetEnv::probe(target)?;
    let mut processor = BySizeProcessor::new(filter);
    let options = WalkOptions {
        verbose,
        ..WalkOptions::default()
    };
    Walker::with_options(target, env, options).walk(&mut processor, console)?;
    processor.print(&env, console);
    Ok(())
}

fn umdh<T: Target + ?Sized>(
    target: &T,
    args: &str,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let mut eol = LineEnding::Lf;
    let mut path = None;
    for token in args.split_whitespace() {
        match token {
            "-crlf" => eol = LineEnding::Crlf,
            other => path = Some(other),
        }
    }
    let path = path.ok_or_else(|| Error::Malformed("usage: umdh [-crlf] <file>".into()))?;

    let env = TargetEnv::probe(target)?;
    let mut processor = UmdhProcessor::create(target, env, Path::new(path), eol)?;
    Walker::new(target, env).walk(&mut processor, console)
}

fn ust_trace<T: Target + ?Sized>(
    target: &T,
    args: &str,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let expr = args.trim();
    if expr.is_empty() {
        return Err(Error::Malformed("usage: ust <addr>".into()));
    }
    let address = target.resolve_expression(expr)?;
    let env = TargetEnv::probe(target)?;
    ust::print_stack_trace(target, &env, address, "", console)
}

/// `0x`-prefixed hex or decimal.
fn parse_number(text: &str) -> error::Result<u64> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| Error::Malformed(format!("not a number: {text}")))
}
