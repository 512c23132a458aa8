use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use patchup::cache::CacheLayout;
use patchup::create::{self, CreateOptions};
use patchup::download::{DirDownloadHandler, DownloadHandler};
use patchup::events::{Event, EventPump};
use patchup::self_patch;
use patchup::{PatchOutcome, Patcher, PatcherConfig, VersionCode};

#[derive(Parser)]
#[command(name = "patchup", about = "Software update engine: publisher and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a release: manifest, repair blobs, installer snapshot and an
    /// optional incremental patch against the previous version
    Create {
        /// Directory containing the new version's files
        #[arg(long)]
        new: PathBuf,
        /// Directory containing the previous version's files
        #[arg(long, requires = "previous_version")]
        old: Option<PathBuf>,
        /// Version the old directory corresponds to
        #[arg(long)]
        previous_version: Option<VersionCode>,
        /// Server output directory
        #[arg(long, short)]
        output: PathBuf,
        /// Product name
        #[arg(long)]
        name: String,
        /// Version being published
        #[arg(long)]
        version: VersionCode,
        /// Base URL the client prepends to relative download paths
        #[arg(long, default_value = "")]
        base_url: String,
        /// Maintenance-check URL recorded in the manifest
        #[arg(long, default_value = "")]
        maintenance_url: String,
        /// Glob patterns the client must never touch
        #[arg(long)]
        ignore: Vec<String>,
        /// Skip the full installer snapshot
        #[arg(long)]
        no_installer: bool,
    },
    /// Check whether an update is available
    Check {
        #[command(flatten)]
        client: ClientArgs,
        /// Compare version markers only, skipping per-file verification
        #[arg(long)]
        version_only: bool,
    },
    /// Bring the install root up to date
    Update {
        #[command(flatten)]
        client: ClientArgs,
        /// Stage files and write a self-patch script instead of touching the
        /// install root directly
        #[arg(long)]
        self_patching: bool,
        /// Self-patch executor to launch once staging completes
        #[arg(long, requires = "self_patching")]
        self_patcher: Option<PathBuf>,
        /// Executable the self-patch executor launches when it finishes
        #[arg(long, requires = "self_patcher")]
        post_run: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct ClientArgs {
    /// Install root
    #[arg(long)]
    root: PathBuf,
    /// URL of the VersionInfo manifest (or a path inside --mirror)
    #[arg(long)]
    url: String,
    /// Cache root directory
    #[arg(long)]
    cache: PathBuf,
    /// Serve downloads from a local directory instead of HTTP
    #[arg(long)]
    mirror: Option<PathBuf>,
}

impl ClientArgs {
    fn into_config(self) -> PatcherConfig {
        let mut config = PatcherConfig::new(self.root, self.url, self.cache);
        if let Some(mirror) = self.mirror {
            config.handler_factory = Some(Box::new(move || {
                Ok(Box::new(DirDownloadHandler::new(mirror.clone())) as Box<dyn DownloadHandler>)
            }));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            new,
            old,
            previous_version,
            output,
            name,
            version,
            base_url,
            maintenance_url,
            ignore,
            no_installer,
        } => {
            println!("Publishing {name} {version}...");
            let start = Instant::now();
            let summary = create::create_release(CreateOptions {
                new_dir: new,
                old_dir: old,
                previous_version,
                output,
                name,
                version,
                base_download_url: base_url,
                maintenance_check_url: maintenance_url,
                ignored_paths: ignore,
                skip_installer: no_installer,
            })
            .await?;

            println!("\nRelease published!");
            println!("  Files: {}", summary.files);
            if summary.installer_written {
                println!("  Installer snapshot written");
            }
            if summary.patched_files + summary.new_files + summary.renamed_files > 0 {
                println!(
                    "  Incremental patch: {} diffed, {} new, {} renamed",
                    summary.patched_files, summary.new_files, summary.renamed_files
                );
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Check {
            client,
            version_only,
        } => {
            let mut patcher = Patcher::new(client.into_config());
            let pump = attach_printer(&mut patcher)?;
            patcher.check_for_updates(version_only);
            let outcome = patcher.wait()?;
            drop(patcher);
            let _ = pump.join();
            match outcome {
                PatchOutcome::AlreadyUpToDate => println!("Up to date."),
                PatchOutcome::Success => println!("An update is available."),
            }
        }
        Commands::Update {
            client,
            self_patching,
            self_patcher,
            post_run,
        } => {
            let cache_root = client.cache.clone();
            let mut patcher = Patcher::new(client.into_config());

            // The product name only becomes known once the manifest arrives;
            // grab it off the event stream for the self-patch handoff.
            let product = Arc::new(Mutex::new(None::<String>));
            let seen = product.clone();
            let rx = patcher
                .take_events()
                .context("event receiver already taken")?;
            let pump = EventPump::new(rx).forward(move |event| {
                if let Event::VersionInfoFetched(info) = &event {
                    if let Ok(mut slot) = seen.lock() {
                        *slot = Some(info.name.clone());
                    }
                }
                print_event(event);
            });

            patcher.run(self_patching);
            let outcome = patcher.wait()?;
            drop(patcher);
            let _ = pump.join();

            match outcome {
                PatchOutcome::AlreadyUpToDate => println!("Up to date."),
                PatchOutcome::Success if !self_patching => println!("Update complete."),
                PatchOutcome::Success => {
                    let name = product
                        .lock()
                        .ok()
                        .and_then(|slot| slot.clone())
                        .context("manifest never arrived")?;
                    let layout = CacheLayout::new(&cache_root, &name);
                    println!(
                        "Staged; pending script at {}",
                        layout.instructions_path().display()
                    );
                    if let Some(executor) = &self_patcher {
                        self_patch::spawn_executor(
                            executor,
                            &layout.instructions_path(),
                            &layout.cursor_path(),
                            post_run.as_deref(),
                        )?;
                        println!("Self-patch executor launched; exiting.");
                    }
                }
            }
        }
    }
    Ok(())
}

fn attach_printer(patcher: &mut Patcher) -> Result<std::thread::JoinHandle<()>> {
    let rx = patcher
        .take_events()
        .context("event receiver already taken")?;
    Ok(EventPump::new(rx).forward(print_event))
}

fn print_event(event: Event) {
    match event {
        Event::Log(log) => println!("{log}"),
        Event::Progress(p) => println!("  {:>3}% {}", p.percentage, p.label),
        Event::OverallProgress(p) => println!("[{:>3}%] {}", p.percentage, p.label),
        Event::MethodChanged(method) => println!("Using {method:?} method"),
        Event::VersionFetched { current, new } => {
            if current.is_valid() {
                println!("Installed: {current}, available: {new}");
            } else {
                println!("No installed version, available: {new}");
            }
        }
        Event::Started
        | Event::Finished
        | Event::StageChanged(_)
        | Event::VersionInfoFetched(_) => {}
    }
}
