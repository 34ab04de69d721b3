use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tfi_core::{ImportPlan, RunScope};
use tfi_sync::FeedSource;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tfi-cli")]
#[command(about = "Transit feed importer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one feed archive into a project.
    #[command(group(ArgGroup::new("source").required(true).args(["file", "dir", "url"])))]
    Import {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Unpacked feed directory.
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        project: Uuid,
        /// Defaults to a fresh id.
        #[arg(long)]
        actor: Option<Uuid>,
        /// Load into memory only.
        #[arg(long)]
        dry_run: bool,
        /// Print the full summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete every imported row of a project.
    Reset {
        #[arg(long)]
        project: Uuid,
    },
    /// Print the table processing order.
    Plan,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Import {
            file,
            dir,
            url,
            project,
            actor,
            dry_run,
            json,
        } => {
            let source = match (file, dir, url) {
                (Some(path), _, _) => FeedSource::File(path),
                (_, Some(path), _) => FeedSource::Dir(path),
                (_, _, Some(url)) => FeedSource::Url(url),
                _ => bail!("one of --file, --dir or --url is required"),
            };
            let scope = RunScope::new(project, actor.unwrap_or_else(Uuid::new_v4));
            let summary = tfi_sync::run_import_from_env(scope, source, dry_run).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "import complete: run_id={} loaded=[{}] failed=[{}] skipped=[{}] rows={}",
                    summary.run_id,
                    summary.loaded_tables.join(","),
                    summary.failed_tables.join(","),
                    summary.skipped_tables.join(","),
                    summary.total_accepted()
                );
                if let Some(path) = &summary.log_path {
                    println!("run log: {}", path.display());
                }
            }
            if summary.is_total_failure() {
                bail!("no table could be imported");
            }
        }
        Commands::Reset { project } => {
            let removed = tfi_sync::reset_project_from_env(project).await?;
            println!("reset complete: project={project} rows_removed={removed}");
        }
        Commands::Plan => {
            let plan = ImportPlan::derive()?;
            for (position, kind) in plan.order().iter().enumerate() {
                let spec = kind.spec();
                println!(
                    "{:>2}. {:<16} {}",
                    position + 1,
                    spec.file_name,
                    if spec.required { "required" } else { "optional" }
                );
            }
        }
    }

    Ok(())
}
