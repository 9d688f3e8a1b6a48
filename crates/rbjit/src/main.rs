use anyhow::{Context, Result};
use clap::Parser;
use rbjit::{compile_iseq, CompileOptions, InstrSeq};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// rbjit — compile a serialized method body to SSA-form IR.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input instruction sequence (.json)
    input: PathBuf,

    /// Name of the emitted function
    #[arg(long, default_value = "method")]
    name: String,

    /// Print the instruction listing before compiling
    #[arg(long)]
    disasm: bool,

    /// Output IR file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let iseq: InstrSeq = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", cli.input.display()))?;

    let options = CompileOptions {
        dump_insns: cli.disasm,
    };
    let module = compile_iseq(&iseq, &cli.name, &options).context("compilation failed")?;

    let ir_text = module.to_string();
    if let Some(output_path) = cli.output {
        fs::write(&output_path, &ir_text)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        eprintln!("rbjit: wrote {}", output_path.display());
    } else {
        print!("{}", ir_text);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_defaults() {
        let cli = Cli::parse_from(["rbjit", "method.json"]);
        assert_eq!(cli.name, "method");
        assert!(!cli.disasm);
        assert!(cli.output.is_none());
    }
}
