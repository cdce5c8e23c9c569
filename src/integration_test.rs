//! End-to-end checks against a real Python interpreter. Each test is skipped
//! when no interpreter can be started on this host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::analysis::policy::SourcePolicy;
use crate::core::domain::{ExecutionLimits, Report, Strategy, Termination, VerdictCategory};
use crate::core::pipeline::test_support::create_challenge;
use crate::core::service::SolutionChecker;
use crate::core::traits::executor::{ExecuteError, Executor};
use crate::native::executor::NativeExecutor;
use crate::native::sandbox::Isolation;

fn python() -> String {
    std::env::var("TUTOR_RUNNER_PYTHON").unwrap_or_else(|_| "python3".to_string())
}

async fn python_executor(scratch_root: &Path) -> Option<NativeExecutor> {
    let executor = NativeExecutor::new(python(), scratch_root, Isolation::BestEffort);
    match executor.preflight().await {
        Ok(_) => Some(executor),
        Err(e) => {
            eprintln!("skipping: no usable python interpreter ({})", e);
            None
        }
    }
}

/// An executor that insists on namespaces and lets any source through, so
/// the sandbox alone has to stop the program.
async fn isolated_executor(scratch_root: &Path) -> Option<NativeExecutor> {
    let executor = NativeExecutor::new(python(), scratch_root, Isolation::Required)
        .with_policy(SourcePolicy::permissive());
    match executor.preflight().await {
        Ok(_) => Some(executor),
        Err(e) => {
            eprintln!("skipping: sandbox isolation is unavailable ({})", e);
            None
        }
    }
}

async fn check(
    executor: NativeExecutor,
    limits: ExecutionLimits,
    code: &str,
    strategy: Strategy,
    rules: serde_json::Value,
) -> Report {
    let checker = SolutionChecker::new(Arc::new(executor), 2, limits);
    checker
        .execute_and_validate(code, Arc::new(create_challenge(strategy, rules)))
        .await
}

fn scratch_is_empty(scratch_root: &Path) -> bool {
    std::fs::read_dir(scratch_root).unwrap().count() == 0
}

#[tokio::test]
async fn test_hello_world_passes() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let report = check(
        executor,
        ExecutionLimits::default(),
        "print(\"Hello, World!\")",
        Strategy::ExactMatch,
        json!({ "expected": "Hello, World!\n" }),
    )
    .await;

    assert!(report.verdict.passed, "{}", report.verdict.feedback);
    let execution = report.execution.unwrap();
    assert_eq!(execution.termination, Termination::Completed);
    assert_eq!(execution.stdout, "Hello, World!\n");
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };
    let limits = ExecutionLimits {
        time_ms: 2000,
        ..ExecutionLimits::default()
    };

    let report = check(
        executor,
        limits,
        "while True:\n    pass\n",
        Strategy::OutputMatch,
        json!({ "required": ["done"] }),
    )
    .await;

    assert_eq!(report.verdict.category, VerdictCategory::Timeout);
    assert!(report.verdict.feedback.contains("took too long"));
    let execution = report.execution.unwrap();
    assert_eq!(execution.termination, Termination::TimedOut);
    assert!(!execution.success);
    assert!(execution.duration_ms >= 2000);
    assert!(execution.duration_ms < 4000, "took {} ms", execution.duration_ms);
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_runtime_error_feedback_names_the_line() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let report = check(
        executor,
        ExecutionLimits::default(),
        "print('start')\nx = 1/0\n",
        Strategy::OutputMatch,
        json!({ "required": ["start"] }),
    )
    .await;

    assert!(!report.verdict.passed);
    assert_eq!(report.verdict.category, VerdictCategory::LearnerError);
    assert!(report.verdict.feedback.contains("line 2"), "{}", report.verdict.feedback);
    assert!(report.verdict.feedback.contains("ZeroDivisionError"));
    assert_eq!(report.verdict.hint.as_deref(), Some("Hint: Use print"));

    let execution = report.execution.unwrap();
    assert_eq!(execution.termination, Termination::RuntimeError);
    assert_eq!(execution.exit_code, Some(1));
    assert_eq!(execution.stdout, "start\n");
    assert!(!execution.stderr.contains(&*scratch_root.path().to_string_lossy()));
}

#[tokio::test]
async fn test_syntax_error_is_explained() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let report = check(
        executor,
        ExecutionLimits::default(),
        "print('unclosed'\n",
        Strategy::ExactMatch,
        json!({ "expected": "unclosed" }),
    )
    .await;

    assert_eq!(report.verdict.category, VerdictCategory::LearnerError);
    assert!(report.verdict.feedback.contains("Syntax error"), "{}", report.verdict.feedback);
}

#[tokio::test]
async fn test_huge_output_is_capped() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };
    let limits = ExecutionLimits {
        output_limit_bytes: 10_000,
        ..ExecutionLimits::default()
    };

    let report = check(
        executor,
        limits,
        "while True:\n    print('x' * 1000)\n",
        Strategy::OutputMatch,
        json!({ "required": ["x"] }),
    )
    .await;

    assert!(!report.verdict.passed);
    assert_eq!(report.verdict.category, VerdictCategory::LearnerError);
    let execution = report.execution.unwrap();
    assert_eq!(execution.termination, Termination::OutputTooLarge);
    assert!(execution.truncated);
    assert!(execution.stdout.len() + execution.stderr.len() <= 10_000);
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_memory_limit_stops_large_allocations() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let result = executor
        .execute(
            "data = bytearray(4 * 1024 ** 3)\nprint(len(data))\n",
            &ExecutionLimits::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::RuntimeError);
    assert!(result.stderr.contains("MemoryError"), "{}", result.stderr);
}

#[tokio::test]
async fn test_structure_check_runs_the_code() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let report = check(
        executor,
        ExecutionLimits::default(),
        "for i in range(3):\n    print(i)\n",
        Strategy::AstCheck,
        json!({ "require": ["for_loop"], "forbid": ["while_loop"] }),
    )
    .await;

    assert!(report.verdict.passed, "{}", report.verdict.feedback);
    assert_eq!(report.execution.unwrap().stdout, "0\n1\n2\n");
}

#[tokio::test]
async fn test_restricted_import_is_rejected() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };

    let report = check(
        executor,
        ExecutionLimits::default(),
        "import os\nos.system('echo hi')\n",
        Strategy::OutputMatch,
        json!({ "required": ["hi"] }),
    )
    .await;

    assert!(!report.verdict.passed);
    assert_eq!(report.verdict.category, VerdictCategory::LearnerError);
    assert!(report.verdict.feedback.contains("os"));
    assert_eq!(report.execution.unwrap().termination, Termination::Rejected);
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_cancellation_kills_the_program() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            executor
                .execute("import time\ntime.sleep(30)\n", &ExecutionLimits::default(), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("cancelled run should stop promptly")
        .unwrap();
    assert!(matches!(result, Err(ExecuteError::Cancelled)));
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_writes_outside_scratch_fail() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = isolated_executor(scratch_root.path()).await else {
        return;
    };
    let outside = tempfile::tempdir().unwrap();
    let marker = outside.path().join("escaped.txt");

    let code = format!(
        "from pathlib import Path\nPath({:?}).write_text('escaped')\n",
        marker.to_str().unwrap()
    );
    let result = executor
        .execute(&code, &ExecutionLimits::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::RuntimeError);
    assert!(result.stderr.contains("Read-only file system"), "{}", result.stderr);
    assert!(!marker.exists());
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_scratch_directory_stays_writable() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = isolated_executor(scratch_root.path()).await else {
        return;
    };

    let code = "import tempfile\n\
                from pathlib import Path\n\
                Path('notes.txt').write_text('kept')\n\
                with tempfile.TemporaryFile() as f:\n    f.write(b'x')\n\
                print(Path('notes.txt').read_text())\n";
    let result = executor
        .execute(code, &ExecutionLimits::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::Completed, "{}", result.stderr);
    assert_eq!(result.stdout, "kept\n");
    assert!(scratch_is_empty(scratch_root.path()));
}

#[tokio::test]
async fn test_loopback_connections_are_refused() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = isolated_executor(scratch_root.path()).await else {
        return;
    };
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let code = format!(
        "import socket\n\
         try:\n    socket.create_connection(('127.0.0.1', {port}), timeout=2)\n    print('connected')\n\
         except OSError:\n    print('blocked')\n"
    );
    let result = executor
        .execute(&code, &ExecutionLimits::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::Completed, "{}", result.stderr);
    assert_eq!(result.stdout, "blocked\n");
    drop(listener);
}

#[tokio::test]
async fn test_leftover_children_are_killed_when_the_program_exits() {
    let scratch_root = tempfile::tempdir().unwrap();
    let Some(executor) = python_executor(scratch_root.path()).await else {
        return;
    };
    let executor = executor.with_policy(SourcePolicy::permissive());

    let code = "import os, time\n\
                if os.fork() == 0:\n    time.sleep(30)\n\
                print('parent done')\n";
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        executor.execute(code, &ExecutionLimits::default(), CancellationToken::new()),
    )
    .await
    .expect("the run should end with its leader")
    .unwrap();

    assert_eq!(result.termination, Termination::Completed, "{}", result.stderr);
    assert_eq!(result.stdout, "parent done\n");
}
