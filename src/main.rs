use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dockhand::db::{self, migrate, schema};
use dockhand::update::{self, manifest, GitShowFetcher};
use dockhand::{RetryPolicy, UpdateConfig};

#[derive(Parser)]
#[command(name = "dockhand", about = "Atomic engine updater and migration runner")]
struct Cli {
    /// Root directory holding engine/, migrations/ and extensions/
    #[arg(long, value_name = "PATH", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply a versioned file set to the live engine directory
    Update {
        /// Version tag to fetch file content from
        #[arg(long, value_name = "TAG")]
        tag: String,
        /// JSON manifest describing the file-set delta
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
        /// Git repository the tag lives in (defaults to the root)
        #[arg(long, value_name = "PATH")]
        source: Option<PathBuf>,
    },
    /// Apply pending core and extension migrations
    Migrate {
        /// SQLite database file
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
    },
    /// Report schema/tracking consistency without changing anything
    Verify {
        /// SQLite database file
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
    },
    /// Repair leftover state from a previous crashed update
    Recover,
}

#[tokio::main]
async fn main() -> ExitCode {
    dockhand::logging::init();

    let cli = Cli::parse();
    let config = UpdateConfig::for_root(&cli.root);

    match cli.cmd {
        Cmd::Update {
            tag,
            manifest: manifest_path,
            source,
        } => {
            let changes = manifest::load_file_set(&manifest_path);
            let repo = source.unwrap_or_else(|| cli.root.clone());
            let fetcher = GitShowFetcher::new(repo);

            let outcome = update::run_engine_update(&tag, &changes, &fetcher, &config).await;
            print_json(&outcome);
            if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Cmd::Migrate { db } => {
            let pool = match db::open_pool(&db).await {
                Ok(pool) => pool,
                Err(error) => return fail(&error),
            };

            match schema::verify_migration_state(&pool).await {
                Ok(report) => schema::print_state_report(&report),
                Err(error) => eprintln!("schema verification unavailable: {error}"),
            }

            let policy = RetryPolicy::default();
            let core = migrate::run_migrations(&pool, &config.migrations_dir, &policy).await;
            let extensions =
                migrate::run_all_extension_migrations(&pool, &config.extensions_dir, &policy)
                    .await;

            print_json(&core);
            print_json(&extensions);
            if core.success && extensions.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Cmd::Verify { db } => {
            let pool = match db::open_pool(&db).await {
                Ok(pool) => pool,
                Err(error) => return fail(&error),
            };
            match schema::verify_migration_state(&pool).await {
                Ok(report) => {
                    schema::print_state_report(&report);
                    print_json(&report);
                    ExitCode::SUCCESS
                }
                Err(error) => fail(&error),
            }
        }
        Cmd::Recover => {
            let report = update::recover_from_previous_failure(&config);
            print_json(&report);
            if report.error.is_none() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(error) => eprintln!("failed to render result: {error}"),
    }
}

fn fail(error: &dockhand::AppError) -> ExitCode {
    eprintln!("{error}");
    ExitCode::FAILURE
}
