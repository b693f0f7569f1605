use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use ristretto::interpreter::Interpreter;
use ristretto::loader::{child_dirs, ClassLoader};

#[derive(Parser)]
#[command(name = "ristretto")]
#[command(about = "A minimal interpreter for JVM class files")]
#[command(version)]
struct Cli {
    /// Path to a .class file; its stem names the entry class.
    #[arg(value_name = "CLASS_FILE")]
    input: PathBuf,

    /// Raise log verbosity (-v for loader events, -vv for an instruction
    /// trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    if cli.input.extension().map_or(true, |ext| ext != "class") {
        bail!("expected a .class file, got {}", cli.input.display());
    }
    let class_name = cli
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| {
            format!("cannot derive a class name from {}", cli.input.display())
        })?
        .to_owned();

    // Search path: the entry class's directory, the immediate children of
    // $JDK_CLASSES, then the current directory.
    let mut loader = ClassLoader::new();
    match cli.input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            loader.add_search_dir(parent);
        }
        _ => loader.add_search_dir("."),
    }
    if let Ok(jdk_classes) = std::env::var("JDK_CLASSES") {
        for dir in child_dirs(Path::new(&jdk_classes)) {
            loader.add_search_dir(dir);
        }
    }
    loader.add_search_dir(".");

    let mut interpreter = Interpreter::new(loader);
    interpreter
        .run_main(&class_name)
        .with_context(|| format!("failed running {class_name}.main"))?;
    Ok(())
}
