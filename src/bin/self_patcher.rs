//! Minimal self-patch executor. Runs after the patched application has
//! exited, replays the pending instruction script, optionally relaunches the
//! application, and then terminates hard since its own binary may have been
//! replaced mid-script.

use std::path::PathBuf;

use clap::Parser;

use patchup::self_patch::{launch_post_patch, SelfPatcher};

#[derive(Parser)]
#[command(name = "self-patcher", about = "Replays a pending self-patch script")]
struct Cli {
    /// Path to the instruction script written by the patcher
    instructions: PathBuf,
    /// Path to the companion cursor file
    cursor: PathBuf,
    /// Executable to launch once the script completes
    #[arg(long)]
    launch: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match SelfPatcher::default().run(&cli.instructions, &cli.cursor) {
        Ok(()) => {
            if let Some(exe) = cli.launch.as_deref().filter(|exe| exe.exists()) {
                if let Err(e) = launch_post_patch(exe) {
                    tracing::error!(error = %e, "failed to relaunch the application");
                }
            }
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "self-patch failed");
            1
        }
    };
    std::process::exit(code);
}
