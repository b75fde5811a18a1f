use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use skink::compiler::ast::Program;
use skink::compiler::foreign::ForeignDecl;
use skink::runtime::machine::render_word;
use skink::{compiler, CompilerOptions, LivenessMode};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LivenessArg {
    Naive,
    #[default]
    Precise,
}

impl From<LivenessArg> for LivenessMode {
    fn from(arg: LivenessArg) -> Self {
        match arg {
            LivenessArg::Naive => LivenessMode::Naive,
            LivenessArg::Precise => LivenessMode::Precise,
        }
    }
}

#[derive(Args)]
struct BuildArgs {
    /// Omit arity/type/bounds checks and heap pre-checks in primitives
    #[arg(long)]
    unsafe_primitives: bool,

    /// Omit garbage-collection checkpoints (allocation failure is fatal)
    #[arg(long)]
    no_gc: bool,

    /// Compile independent top-level forms on worker threads
    #[arg(long)]
    parallel: bool,

    /// Evaluate sub-expressions directly into their target registers
    #[arg(long)]
    fast_targetting: bool,

    /// Maintain the global-variable access ring in the context
    #[arg(long)]
    keep_variable_stack: bool,

    /// The input was CPS-converted; falling off the end is an error
    #[arg(long)]
    cps: bool,

    /// Liveness-range strategy (naive, precise)
    #[arg(long, value_enum, default_value = "precise")]
    liveness: LivenessArg,

    /// Heap semispace size in bytes
    #[arg(long, default_value = "262144")]
    heap_bytes: u64,

    /// Scheme value stack size in bytes
    #[arg(long, default_value = "65536")]
    stack_bytes: u64,

    /// Foreign-function declarations, as a JSON file
    #[arg(long, value_name = "FILE")]
    foreigns: Option<PathBuf>,
}

impl BuildArgs {
    fn options(&self) -> CompilerOptions {
        CompilerOptions {
            safe_primitives: !self.unsafe_primitives,
            safe_flonums: !self.unsafe_primitives,
            safe_cons: !self.unsafe_primitives,
            garbage_collection: !self.no_gc,
            do_cps_conversion: self.cps,
            parallel: self.parallel,
            fast_expression_targetting: self.fast_targetting,
            keep_variable_stack: self.keep_variable_stack,
            liveness: self.liveness.into(),
            heap_semispace_bytes: self.heap_bytes,
            stack_bytes: self.stack_bytes,
            ..Default::default()
        }
    }

    fn foreign_decls(&self) -> Result<Vec<ForeignDecl>, String> {
        match &self.foreigns {
            None => Ok(Vec::new()),
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
                serde_json::from_str(&text)
                    .map_err(|e| format!("bad foreign declarations in {}: {}", path.display(), e))
            }
        }
    }
}

#[derive(Parser)]
#[command(name = "skink")]
#[command(about = "A native-code compiler for a small Scheme dialect", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a program (a JSON-serialized alpha-converted AST)
    Run {
        /// The program file to run
        file: PathBuf,

        #[command(flatten)]
        build: BuildArgs,
    },
    /// Compile a program and emit the linked instruction stream as JSON
    Compile {
        /// The program file to compile
        file: PathBuf,

        /// Write the listing here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,
    },
    /// List the primitive library with resolved entry addresses
    Primitives {
        #[command(flatten)]
        build: BuildArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { file, build } => run(&file, &build),
        Commands::Compile {
            file,
            output,
            build,
        } => emit_listing(&file, output.as_deref(), &build),
        Commands::Primitives { build } => list_primitives(&build),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load_program(path: &std::path::Path) -> Result<Program, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("bad program in {}: {}", path.display(), e))
}

fn run(path: &std::path::Path, build: &BuildArgs) -> Result<(), String> {
    let program = load_program(path)?;
    let compiled = compiler::compile_with_foreigns(&program, &build.options(), &build.foreign_decls()?)?;
    let mut machine = compiler::instantiate(&compiled);
    let result = machine.run(compiled.entry)?;
    if let Some(code) = result.error_code() {
        return Err(code.describe().to_string());
    }
    println!("{}", render_word(&machine.ctx, result, true));
    Ok(())
}

fn emit_listing(
    path: &std::path::Path,
    output: Option<&std::path::Path>,
    build: &BuildArgs,
) -> Result<(), String> {
    let program = load_program(path)?;
    let compiled = compiler::compile_with_foreigns(&program, &build.options(), &build.foreign_decls()?)?;
    let listing = serde_json::json!({
        "entry": compiled.linked.addr_of(compiled.entry),
        "data_bytes": compiled.linked.data_bytes,
        "foreigns": compiled.foreign_names,
        "instrs": compiled.instrs,
    });
    let text = serde_json::to_string_pretty(&listing).map_err(|e| e.to_string())?;
    match output {
        Some(out) => std::fs::write(out, text)
            .map_err(|e| format!("cannot write {}: {}", out.display(), e)),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

fn list_primitives(build: &BuildArgs) -> Result<(), String> {
    let empty = Program { forms: Vec::new() };
    let compiled = compiler::compile(&empty, &build.options())?;
    for (name, addr) in &compiled.primitive_table {
        println!("{:#010x}  {}", addr, name);
    }
    Ok(())
}
