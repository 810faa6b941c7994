use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use lazy_static::lazy_static;
use lazyk::eval::Machine;
use lazyk::expr::atom;
use lazyk::parse::{self, Source};
use log::info;
use std::io::Read;
use std::process;

/// Cells per semispace when neither `--heap-cells` nor the environment
/// says otherwise; about 48 MiB per space.
const DEFAULT_SEMI_CELLS: usize = 2 << 20;

/// Both the numeral decoder and deeply nested sources recurse, so the
/// evaluator gets a thread with a generous stack.
const EVAL_STACK_BYTES: usize = 256 * 1024 * 1024;

lazy_static! {
    static ref DEFAULT_HEAP_CELLS: usize = std::env::var("LAZYK_HEAP_CELLS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SEMI_CELLS);
}

#[derive(Parser, Debug)]
#[command(
    name = "lazyk",
    version,
    about = "Interpreter for the Lazy K programming language",
    long_about = "Interpreter for the Lazy K programming language.\n\n\
        If more than one -e or filename argument is given, the programs \
        are combined by functional composition (in Unix pipe order, not \
        mathematical-notation order). If none is given, the result is a \
        degenerate composition, i.e. the identity function."
)]
struct Cli {
    /// Program files; `-` reads program text from standard input
    #[arg(value_name = "FILE")]
    files: Vec<String>,

    /// Take program code from the argument string (like Perl's -e)
    #[arg(short = 'e', value_name = "PROGRAM", action = ArgAction::Append)]
    programs: Vec<String>,

    /// Put the streams into binary mode on systems that care (accepted
    /// for compatibility; streams are always raw bytes here)
    #[arg(short = 'b')]
    binary: bool,

    /// Heap cells per semispace [env: LAZYK_HEAP_CELLS]
    #[arg(long, value_name = "CELLS")]
    heap_cells: Option<usize>,
}

enum Fragment {
    File(String),
    Literal(String),
}

/// Fragments in command-line order, so `-e` programs and files compose
/// exactly as written.
fn fragments_in_order(cli: &Cli, matches: &clap::ArgMatches) -> Vec<Fragment> {
    let mut frags: Vec<(usize, Fragment)> = Vec::new();
    if let Some(indices) = matches.indices_of("files") {
        for (i, name) in indices.zip(&cli.files) {
            frags.push((i, Fragment::File(name.clone())));
        }
    }
    if let Some(indices) = matches.indices_of("programs") {
        for (i, text) in indices.zip(&cli.programs) {
            frags.push((i, Fragment::Literal(text.clone())));
        }
    }
    frags.sort_by_key(|(i, _)| *i);
    frags.into_iter().map(|(_, f)| f).collect()
}

fn run() -> Result<i32> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    if cli.binary {
        info!("binary mode requested; byte streams are already raw");
    }
    let semi_cells = cli.heap_cells.unwrap_or(*DEFAULT_HEAP_CELLS);
    let fragments = fragments_in_order(&cli, &matches);
    info!(
        "{} program fragment(s), {} cells per semispace",
        fragments.len(),
        semi_cells
    );

    let mut machine = Machine::new(
        semi_cells,
        Box::new(std::io::stdin()),
        Box::new(std::io::stdout()),
    )?;

    let mut program = atom::I;
    for fragment in fragments {
        let mut source = match fragment {
            Fragment::File(name) if name == "-" => {
                let mut text = Vec::new();
                std::io::stdin()
                    .read_to_end(&mut text)
                    .context("reading program from standard input")?;
                Source::file("(standard input)", text)
            }
            Fragment::File(name) => {
                let text = std::fs::read(&name)
                    .with_context(|| format!("Unable to open the file \"{}\"", name))?;
                Source::file(&name, text)
            }
            Fragment::Literal(text) => Source::command_line(&text),
        };
        let parsed = parse::parse_source(machine.heap_mut(), &mut source)?;
        program = parse::compose(machine.heap_mut(), parsed, program)?;
    }

    machine.load(program)?;
    Ok(machine.run()?)
}

fn main() {
    env_logger::init();
    let child = std::thread::Builder::new()
        .stack_size(EVAL_STACK_BYTES)
        .spawn(run)
        .expect("failed to spawn the evaluator thread");
    let code = match child.join() {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            eprintln!("{:#}", err);
            err.downcast_ref::<lazyk::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(1)
        }
        Err(_) => 4,
    };
    process::exit(code);
}
