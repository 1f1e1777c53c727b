//! Workspace automation tasks.

use std::process::{Command, ExitCode, Stdio};

use clap::{Parser, Subcommand};

/// Workspace automation tasks.
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format code and run clippy with auto-fix.
    Tidy,
    /// Run all tests using nextest.
    Test,
    /// Run the interpreter-lock stress tests repeatedly, in release mode.
    Stress {
        /// Number of rounds.
        #[arg(short, long, default_value_t = 20)]
        rounds: u32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Tidy => tidy(),
        Commands::Test => test(),
        Commands::Stress { rounds } => stress(rounds),
    }
}

/// Run `cargo` with `args`, streaming its output. Reports failures as `what`.
fn cargo(args: &[&str], what: &str) -> bool {
    let status = Command::new("cargo")
        .args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(status) if status.success() => true,
        Ok(_) => {
            eprintln!("{what} failed");
            false
        }
        Err(e) => {
            eprintln!("Failed to run {what}: {e}");
            false
        }
    }
}

fn tidy() -> ExitCode {
    println!("Formatting code...");
    if !cargo(&["fmt", "--all"], "cargo fmt") {
        return ExitCode::FAILURE;
    }

    println!("\nRunning clippy with auto-fix...");
    let fixed = cargo(
        &[
            "clippy",
            "-q",
            "--fix",
            "--all",
            "--all-targets",
            "--all-features",
            "--allow-dirty",
            "--tests",
        ],
        "clippy",
    );
    if fixed {
        println!("\nTidy complete!");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn test() -> ExitCode {
    println!("Running tests with nextest...");
    if cargo(&["nextest", "run", "--all"], "nextest") {
        println!("\nAll tests passed!");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn stress(rounds: u32) -> ExitCode {
    let args = [
        "test",
        "--release",
        "-p",
        "gilua-env",
        "--test",
        "stress",
        "-q",
    ];
    for round in 1..=rounds {
        println!("Stress round {round}/{rounds}...");
        if !cargo(&args, "stress tests") {
            eprintln!("Failed in round {round}");
            return ExitCode::FAILURE;
        }
    }
    println!("\n{rounds} stress rounds passed!");
    ExitCode::SUCCESS
}
