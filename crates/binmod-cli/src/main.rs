//! The `binmod` binary.
//!
//! Loads a parsed AST (JSON), lowers it to the binary module IR, runs the
//! transformation pipeline, and writes the serialized container. Optional
//! flags dump the IR textually, emit a control-flow-graph listing, wrap
//! the output in base64, and report per-phase timing.

mod print;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;

use binmod_ast::Tree;
use binmod_core::container;
use binmod_transform::cfg;

/// Binary-format compiler back-end: AST in, binary module out.
#[derive(Parser)]
#[command(name = "binmod", about = "Lower a format AST into a binary module")]
struct Cli {
    /// AST JSON input file.
    #[arg(short, long)]
    input: PathBuf,

    /// Output file for the serialized module; `-` writes to stdout.
    #[arg(short, long)]
    output: Option<String>,

    /// Control-flow-graph text output file.
    #[arg(short, long)]
    cfg_output: Option<PathBuf>,

    /// Print the converted instructions.
    #[arg(short = 'p', long)]
    print_instructions: bool,

    /// Print only opcode names.
    #[arg(long)]
    print_only_op: bool,

    /// Base64-encode the serialized output.
    #[arg(long)]
    base64: bool,

    /// Print per-phase processing time to stderr.
    #[arg(long)]
    print_process_time: bool,
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let timer = Instant::now();
    let mut phases: Vec<(&str, std::time::Duration)> = Vec::new();
    let mut last = timer.elapsed();
    let mut step = |name: &'static str, phases: &mut Vec<(&str, std::time::Duration)>| {
        let now = timer.elapsed();
        phases.push((name, now - last));
        last = now;
    };

    let text = match fs::read_to_string(&cli.input) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", cli.input.display(), e);
            return 1;
        }
    };
    let tree = match Tree::from_json(&text) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    step("load", &mut phases);

    let mut module = match binmod_lower::lower(&tree) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    step("lower", &mut phases);

    if let Err(e) = binmod_transform::transform(&mut module) {
        eprintln!("error: {}", e);
        return 1;
    }
    step("transform", &mut phases);

    if cli.print_instructions {
        if cli.print_only_op {
            print!("{}", print::render_ops_only(&module));
        } else {
            print!("{}", print::render_module(&module));
        }
    }

    if let Some(cfg_path) = &cli.cfg_output {
        let text = match cfg::write_cfg_text(&module) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("error: {}", e);
                return 1;
            }
        };
        if let Err(e) = fs::write(cfg_path, text) {
            eprintln!("error: cannot write {}: {}", cfg_path.display(), e);
            return 1;
        }
    }

    if let Some(output) = &cli.output {
        let bytes = match container::save(&module) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("error: {}", e);
                return 1;
            }
        };
        let payload = if cli.base64 {
            let mut encoded = BASE64.encode(&bytes).into_bytes();
            // trailing newline for text-editor friendliness
            encoded.push(b'\n');
            encoded
        } else {
            bytes
        };
        let result = if output == "-" {
            std::io::stdout().write_all(&payload)
        } else {
            fs::write(output, &payload)
        };
        if let Err(e) = result {
            eprintln!("error: cannot write {}: {}", output, e);
            return 1;
        }
    }
    step("output", &mut phases);

    if cli.print_process_time {
        for (name, duration) in &phases {
            eprintln!("{} time: {:?}", name, duration);
        }
    }
    0
}
