//! apicase CLI - run templated API test cases.

use anyhow::{anyhow, Context, Result};
use apicase::{
    load_environment, load_templates, CaseExecutionResult, CaseLoader,
    Environment, InMemoryTemplateStore, Orchestrator, RunOutcome, StepStatus,
    TestCase, TracingSink, VariableContext,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// apicase - run API test cases built from request templates.
#[derive(Parser, Debug)]
#[command(name = "apicase", version, about)]
struct Cli {
    /// Case file or directory.
    #[arg(short = 'p', long = "path")]
    case_path: Option<String>,

    /// API template catalog (YAML or JSON).
    #[arg(short = 'T', long = "templates")]
    templates: PathBuf,

    /// Environment file (base_url, headers, variables).
    #[arg(short = 'e', long = "env")]
    env_file: Option<PathBuf>,

    /// Base URL override.
    #[arg(short = 'b', long = "base-url", env = "APICASE_BASE_URL")]
    base_url: Option<String>,

    /// Filter cases by name (partial match).
    #[arg(short = 'f', long = "filter")]
    case_filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Seconds to wait for a cancelled case before giving up on it.
    #[arg(long = "shutdown-timeout", default_value_t = 30)]
    shutdown_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_case_result(result: &CaseExecutionResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m".to_string()
    } else {
        let label = result.overall_status.as_str().to_uppercase();
        format!("\x1b[31m{label}\x1b[0m")
    };
    info!(
        "{} case: {} ({} ms)",
        status, result.case_name, result.duration_ms
    );

    for (i, step) in result.steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Success => "\x1b[32m✓\x1b[0m",
            StepStatus::Skipped => "\x1b[33m-\x1b[0m",
            _ => "\x1b[31m✗\x1b[0m",
        };
        info!(
            "  {}. {} {} ({} ms)",
            i + 1,
            marker,
            step.name,
            step.duration_ms
        );

        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            if let Some(request) = &step.request {
                debug!("     Request: {} {}", request.method, request.url);
            }
            if let Some(response) = &step.response {
                let body = response.body.to_string();
                let truncated = if body.len() > 500 {
                    format!("{}...(truncated)", truncate(&body, 500))
                } else {
                    body
                };
                debug!(
                    "     Response: Status {} {}",
                    response.status, truncated
                );
            }
        }
    }

    if let Some(error) = &result.error {
        error!("  \x1b[31mCase aborted: {}\x1b[0m", error);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn save_case_report(
    result: &CaseExecutionResult,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.case_name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            writeln!(content, "Test case: {}", result.case_name)?;
            writeln!(content, "Status: {}", result.overall_status.as_str())?;
            if let Some(error) = &result.error {
                writeln!(content, "Error: {error}")?;
            }
            writeln!(
                content,
                "Steps: {} total, {} passed, {} failed, {} errored, {} skipped",
                result.total_steps,
                result.passed,
                result.failed,
                result.errored,
                result.skipped
            )?;
            writeln!(content, "Duration: {} ms\n", result.duration_ms)?;
            for (i, step) in result.steps.iter().enumerate() {
                writeln!(
                    content,
                    "  {}. {} ({:?})",
                    i + 1,
                    step.name,
                    step.status
                )?;
                if let Some(error) = &step.error {
                    writeln!(content, "     Error: {error}")?;
                }
                writeln!(content, "     Duration: {} ms", step.duration_ms)?;
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    fs::write(&file_path, content)?;
    Ok(file_path)
}

fn load_cases(case_path: Option<String>) -> Result<Vec<TestCase>> {
    let mut loader = CaseLoader::new();
    for path in ["testcases", "cases"] {
        if Path::new(path).exists() {
            loader.add_path(path);
        }
    }

    let cases = match case_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            if path.is_file() {
                let case = loader.load_case(&path).context(format!(
                    "Failed to load case: {}",
                    path.display()
                ))?;
                vec![case]
            } else {
                loader.load_cases_from_dir(&path).context(format!(
                    "Failed to load cases from directory: {}",
                    path.display()
                ))?
            }
        }
        None => loader.load_all_cases()?,
    };

    if cases.is_empty() {
        return Err(anyhow!("No test cases found"));
    }
    Ok(cases)
}

/// Run one case on a background task. Ctrl-C asks it to stop before its
/// next step and then waits up to `shutdown_timeout`.
async fn run_case(
    orchestrator: &Arc<Orchestrator>,
    case: TestCase,
    shutdown_timeout: Duration,
) -> Option<CaseExecutionResult> {
    let case_name = case.name.clone();
    let handle = orchestrator.spawn(case, VariableContext::new());
    let cancel = handle.cancellation();

    let wait = handle.wait(None);
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(
                "Interrupt received, cancelling '{}' after the current step",
                case_name
            );
            cancel.cancel();
            tokio::time::timeout(shutdown_timeout, wait)
                .await
                .unwrap_or(RunOutcome::Abandoned)
        }
    };

    match outcome {
        RunOutcome::Finished(result) => Some(result),
        RunOutcome::Abandoned => {
            error!(
                "Case '{}' did not stop within {:?}; abandoning it",
                case_name, shutdown_timeout
            );
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let cases = load_cases(args.case_path)?;
    let templates: InMemoryTemplateStore = load_templates(&args.templates)
        .context(format!(
            "Failed to load templates: {}",
            args.templates.display()
        ))?;

    let mut environment = match &args.env_file {
        Some(path) => load_environment(path).context(format!(
            "Failed to load environment: {}",
            path.display()
        ))?,
        None => Environment::default(),
    };
    if let Some(base_url) = args.base_url {
        environment.base_url = Some(base_url);
    }

    let filtered: Vec<TestCase> = match &args.case_filter {
        Some(filter) => cases
            .into_iter()
            .filter(|c| c.name.to_lowercase().contains(&filter.to_lowercase()))
            .collect(),
        None => cases,
    };
    if filtered.is_empty() {
        return Err(anyhow!("No cases matching the filter were found"));
    }

    let orchestrator = Arc::new(
        Orchestrator::new(Arc::new(templates))
            .with_environment(environment)
            .with_sink(Arc::new(TracingSink)),
    );
    let report_dir = args.report_dir.map(PathBuf::from);
    let shutdown_timeout = Duration::from_secs(args.shutdown_timeout);

    let total = filtered.len();
    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;

    info!("Running {} case(s)...", total);
    for (idx, case) in filtered.into_iter().enumerate() {
        info!("Case {}/{}: {}", idx + 1, total, case.name);
        let outcome = run_case(&orchestrator, case, shutdown_timeout).await;
        let Some(result) = outcome else {
            failed += 1;
            break;
        };

        print_case_result(&result, args.verbose);
        if let Some(dir) = &report_dir {
            match save_case_report(&result, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {}", e),
            }
        }

        let cancelled = result.cancelled;
        if result.success {
            passed += 1;
        } else {
            failed += 1;
        }
        if cancelled {
            break;
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \
         \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        total,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 || passed < total {
        exit(1);
    }
    Ok(())
}
