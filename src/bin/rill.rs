// ABOUTME: Demo CLI/REPL for the Rill core. `clap` argument parsing,
// `rustyline` REPL loop, and a script-file mode, fronting
// `rill::{parse, create_context, execute}`.

use clap::Parser as ClapParser;
use rill::{create_context, parse, run, RillOptions};
use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor};
use std::path::PathBuf;

/// Rill pipe-oriented scripting language REPL and script runner
#[derive(ClapParser, Debug)]
#[command(name = "rill")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A dynamically-typed, pipe-oriented scripting language")]
struct CliArgs {
    /// Script file to execute (optional — if not provided, starts the REPL)
    #[arg(value_name = "FILE")]
    script: Option<PathBuf>,

    /// Maximum evaluator call-stack depth before the oldest frame is dropped
    #[arg(long = "max-call-stack", value_name = "DEPTH")]
    max_call_stack_depth: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();

    let options = RillOptions {
        max_call_stack_depth: args.max_call_stack_depth,
        ..Default::default()
    };
    let ctx = create_context(options)?;

    if let Some(script_path) = args.script {
        return run_script(&script_path, &ctx);
    }

    repl(&ctx)
}

fn run_script(path: &PathBuf, ctx: &rill::Context) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read script file {}: {e}", path.display()))?;
    let script = parse(&contents).map_err(|e| anyhow::anyhow!("parse error: {e}"))?;
    let result = futures::executor::block_on(rill::execute(&script, ctx))
        .map_err(|e| anyhow::anyhow!("evaluation error: {e}"))?;
    println!("{}", result.value);
    Ok(())
}

fn repl(ctx: &rill::Context) -> anyhow::Result<()> {
    let config = Config::builder().auto_add_history(true).build();
    let mut rl = DefaultEditor::with_config(config)
        .map_err(|e| anyhow::anyhow!("failed to initialize REPL: {e}"))?;

    let history_file = ".rill_history";
    let _ = rl.load_history(history_file);

    println!("rill {} — pipe-oriented scripting, `exit` to quit", env!("CARGO_PKG_VERSION"));

    loop {
        match rl.readline("rill> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                match futures::executor::block_on(run(line, ctx)) {
                    Ok(result) => println!("=> {}", result.value),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\ngoodbye");
                break;
            }
            Err(err) => {
                eprintln!("error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(history_file);
    Ok(())
}
