use std::net::SocketAddr;
use std::panic;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use crate::config::RunnerConfig;
use crate::core::catalog::ChallengeCatalog;
use crate::core::service::SolutionChecker;
use crate::grpc::models::validation_service_server::ValidationServiceServer;
use crate::grpc::services::ValidationServiceImpl;
use crate::native::executor::NativeExecutor;

mod config;
mod constants;
mod core;
mod grpc;
mod native;
#[cfg(test)]
mod stubs;

#[cfg(test)]
mod integration_test;

#[derive(Debug, Parser)]
#[command(version, about = "Runs and judges learner Python solutions")]
struct Cli {
    #[command(flatten)]
    config: RunnerConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the validation API over gRPC.
    Serve {
        #[arg(long, env = "TUTOR_RUNNER_ADDR", default_value = "[::1]:50051")]
        addr: SocketAddr,
        /// Challenge content that clients can refer to by id.
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Check one solution and print the report as JSON.
    Check {
        #[arg(long)]
        content: PathBuf,
        #[arg(long)]
        challenge: String,
        /// Solution file, or `-` for stdin.
        code: PathBuf,
        #[arg(long, default_value_t = 1)]
        attempt: u32,
    },
    /// Run every reference solution in the content against its own rules.
    Verify {
        #[arg(long)]
        content: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    cli.config.validate()?;

    let executor = NativeExecutor::new(
        &cli.config.python_path,
        cli.config.scratch_root(),
        cli.config.isolation,
    )
    .with_policy(cli.config.source_policy());
    let checker = SolutionChecker::new(
        Arc::new(executor.clone()),
        cli.config.max_concurrent,
        cli.config.execution_limits(),
    );

    // Refuses to start when the interpreter or the sandbox can't be used.
    let version = executor.preflight().await?;
    tracing::info!("Using {}", version);

    match cli.command {
        Command::Serve { addr, content } => {
            let catalog = match content {
                Some(path) => ChallengeCatalog::load(path)?,
                None => ChallengeCatalog::default(),
            };
            if catalog.is_empty() {
                tracing::info!("No challenge content loaded, requests must carry their challenge");
            } else {
                tracing::info!("Loaded {} challenges", catalog.len());
            }

            let service = ValidationServiceServer::new(ValidationServiceImpl::new(
                checker,
                Arc::new(catalog),
            ));

            tracing::info!("gRPC server listening on {}", addr);
            Server::builder().add_service(service).serve(addr).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            content,
            challenge,
            code,
            attempt,
        } => {
            let catalog = ChallengeCatalog::load(content)?;
            let challenge = catalog
                .get(&challenge)
                .ok_or_else(|| format!("unknown challenge {:?}", challenge))?;
            let code = read_code(&code).await?;

            let report = if attempt == 1 {
                checker.execute_and_validate(&code, challenge).await
            } else {
                checker.run(checker.new_submission(&code, challenge, attempt)).await
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            Ok(if report.verdict.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Verify { content } => {
            let catalog = ChallengeCatalog::load(&content)?;
            if catalog.is_empty() {
                return Err(format!("{} contains no challenges", content.display()).into());
            }
            let failures = checker.verify(catalog.iter()).await;
            for report in &failures {
                println!("{}: {}", report.challenge_id, report.verdict.feedback);
            }
            tracing::info!(
                "{} of {} reference solutions pass",
                catalog.len() - failures.len(),
                catalog.len()
            );

            Ok(if failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn read_code(path: &Path) -> std::io::Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        return Ok(code);
    }
    tokio::fs::read_to_string(path).await
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
