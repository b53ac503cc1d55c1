//! `seqrun` — entry point.
//!
//! A single binary exposing submission (`-- <vector>`, the default
//! action), queue control (`--queue-start`, `--queue-pause`, ...), and a
//! CI-compatible read model (`run list`, `run view`, `run watch`).

use clap::{Parser, Subcommand};
use seqrun::config::{Config, ConfigOverrides};
use seqrun::engine::Engine;
use seqrun::errors::SeqError;
use seqrun::readmodel::{self, ListFilters};
use seqrun::recorder::RunStatus;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "seqrun")]
#[command(about = "Strict serial execution pipeline for developer-tool commands", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[arg(long = "pipeline-timeout", global = true)]
    pipeline_timeout: Option<u64>,
    #[arg(long = "memory-limit", global = true)]
    memory_limit: Option<u64>,
    #[arg(long = "log-dir", global = true)]
    log_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long = "no-atomify", global = true)]
    no_atomify: bool,
    #[arg(long = "dont_enforce_runners", global = true)]
    dont_enforce_runners: bool,
    #[arg(long = "only_verified", global = true)]
    only_verified: bool,
    #[arg(long = "enable-second-tier", global = true)]
    enable_second_tier: bool,
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    #[arg(long = "queue-start")]
    queue_start: bool,
    #[arg(long = "queue-status")]
    queue_status: bool,
    #[arg(long = "queue-pause")]
    queue_pause: bool,
    #[arg(long = "queue-resume")]
    queue_resume: bool,
    #[arg(long = "queue-stop")]
    queue_stop: bool,
    #[arg(long = "clear-queue")]
    clear_queue: bool,
    #[arg(long = "close-queue")]
    close_queue: bool,
    #[arg(long = "reopen-queue")]
    reopen_queue: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Command vector to submit, after a literal `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    vector: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// CI-style read model over recorded runs.
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
}

#[derive(Debug, Subcommand)]
enum RunAction {
    List {
        #[arg(short = 'L', long, default_value = "20")]
        limit: usize,
        #[arg(short = 's', long)]
        status: Option<String>,
        #[arg(short = 'b', long)]
        branch: Option<String>,
        #[arg(short = 'w', long)]
        workflow: Option<String>,
        #[arg(short = 'u', long)]
        user: Option<String>,
        #[arg(short = 'c', long)]
        commit: Option<String>,
        #[arg(short = 'e', long)]
        event: Option<String>,
        #[arg(long)]
        created: Option<String>,
        #[arg(short = 'a', long)]
        all: bool,
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        json: Option<String>,
        #[arg(short = 'q', long = "jq")]
        jq: Option<String>,
        #[arg(short = 't', long = "template")]
        template: Option<String>,
    },
    View {
        run_id: Option<String>,
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        log: bool,
        #[arg(long = "log-failed")]
        log_failed: bool,
        #[arg(long)]
        verbose: bool,
        #[arg(long = "exit-status")]
        exit_status: bool,
    },
    Watch {
        run_id: Option<String>,
        #[arg(short, long, default_value = "2")]
        interval: u64,
        #[arg(long = "exit-status")]
        exit_status: bool,
        #[arg(long)]
        compact: bool,
    },
}

fn overrides(cli: &Cli) -> ConfigOverrides {
    ConfigOverrides {
        timeout_s: cli.timeout,
        pipeline_timeout_s: cli.pipeline_timeout,
        memory_limit_mb: cli.memory_limit,
        log_dir: cli.log_dir.clone(),
        verbose: cli.verbose,
        atomify: Some(!cli.no_atomify),
        enforce_runners: Some(!cli.dont_enforce_runners),
        enable_second_tier: Some(cli.enable_second_tier),
        only_verified: Some(cli.only_verified),
        retries: None,
        kill_signal: None,
        event: None,
        workflow: None,
        user: None,
    }
}

fn main() {
    let cli = Cli::parse();
    seqrun::logging::init(cli.verbose);

    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32, SeqError> {
    let config = Config::resolve(&cli.project_root, &overrides(&cli));
    let engine = Engine::new(config);

    if cli.queue_status {
        let status = engine.status();
        println!(
            "depth={} paused={} closed={} running={}",
            status.depth, status.paused, status.closed, status.running
        );
        return Ok(0);
    }
    if cli.queue_pause {
        engine.pause()?;
        return Ok(0);
    }
    if cli.queue_resume {
        engine.resume()?;
        return Ok(0);
    }
    if cli.queue_stop {
        engine.request_stop()?;
        return Ok(0);
    }
    if cli.clear_queue {
        let n = engine.clear()?;
        println!("cleared {n} pending entries");
        return Ok(0);
    }
    if cli.close_queue {
        engine.close()?;
        return Ok(0);
    }
    if cli.reopen_queue {
        engine.reopen()?;
        return Ok(0);
    }

    if let Some(Command::Run { action }) = cli.command {
        return run_read_model(&engine, action);
    }

    if !cli.vector.is_empty() {
        let submitter_id = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "cli".to_string());
        engine.submit(&submitter_id, &cli.vector)?;
        if cli.queue_start {
            let run_id = engine.run_loop()?;
            return Ok(exit_code_for_run(&engine, &run_id));
        }
        return Ok(0);
    }

    if cli.queue_start {
        let run_id = engine.run_loop()?;
        return Ok(exit_code_for_run(&engine, &run_id));
    }

    Err(SeqError::Usage(
        "expected a command vector after `--`, a `--queue-*` control flag, or a `run` subcommand".to_string(),
    ))
}

/// Map a finished run's outcome to the client exit code: `0` success,
/// `130` interrupted/stopped, otherwise the run's aggregate exit code (the
/// last non-zero job exit code observed, e.g. `124` for a timeout).
fn exit_code_for_run(engine: &Engine, run_id: &str) -> i32 {
    let Ok((run, _jobs)) = engine.view_run(run_id) else {
        return 1;
    };
    match run.status {
        RunStatus::Stopped => 130,
        RunStatus::Running => 1,
        RunStatus::Completed => run.exit_code,
        // The pipeline timeout can expire with every job so far having
        // succeeded (exit_code still 0); still report failure.
        RunStatus::Failed => {
            if run.exit_code != 0 {
                run.exit_code
            } else {
                1
            }
        }
    }
}

fn run_read_model(engine: &Engine, action: RunAction) -> Result<i32, SeqError> {
    match action {
        RunAction::List {
            limit,
            status,
            branch,
            workflow,
            user,
            commit,
            event,
            created,
            all,
            json,
            jq,
            template,
        } => {
            let run_ids = engine.list_runs()?;
            let mut runs = Vec::with_capacity(run_ids.len());
            for id in run_ids {
                if let Ok((run, _)) = engine.view_run(&id) {
                    runs.push(run);
                }
            }
            let filters = ListFilters {
                limit: Some(limit),
                status,
                branch,
                workflow,
                user,
                commit,
                event,
                created,
                all,
            };
            let filtered = readmodel::apply_filters(runs, &filters);
            if let Some(expr) = jq {
                let records: Vec<serde_json::Value> = filtered.iter().map(readmodel::run_to_json).collect();
                let array = serde_json::Value::Array(records);
                let Some(selected) = readmodel::apply_jq_path(&array, &expr) else {
                    return Err(SeqError::Usage(format!(
                        "unsupported -q/--jq expression (only dot-paths like '.[].databaseId' are supported): {expr}"
                    )));
                };
                for value in selected {
                    println!("{}", readmodel::render_jq_value(&value));
                }
            } else if let Some(tmpl) = template {
                for run in &filtered {
                    print!("{}", readmodel::render_template(run, &tmpl));
                }
            } else if let Some(fields) = json {
                let field_list: Vec<String> = fields.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
                let records: Vec<serde_json::Value> = filtered
                    .iter()
                    .map(|r| readmodel::select_fields(readmodel::run_to_json(r), &field_list))
                    .collect();
                println!("{}", serde_json::to_string(&records).unwrap_or_default());
            } else {
                for run in &filtered {
                    println!("{}", readmodel::render_list_line(run));
                }
            }
            Ok(0)
        }
        RunAction::View {
            run_id,
            job,
            log,
            log_failed,
            verbose: _,
            exit_status,
        } => {
            let run_id = resolve_run_id(engine, run_id)?;
            let (run, jobs) = engine.view_run(&run_id)?;

            if let Some(job_id) = job {
                let Some(job_record) = jobs.iter().find(|j| j.job_id == job_id) else {
                    return Err(SeqError::JobNotFound(job_id));
                };
                if log || log_failed {
                    if !log_failed || !matches!(job_record.status, seqrun::recorder::JobStatus::Passed) {
                        if let Ok(contents) = std::fs::read_to_string(&job_record.log_path) {
                            print!("{contents}");
                        }
                    }
                } else {
                    println!("{}", serde_json::to_string_pretty(&readmodel::job_to_json(job_record)).unwrap_or_default());
                }
                return Ok(if exit_status { job_record.exit_code.unwrap_or(1) } else { 0 });
            }

            if log || log_failed {
                for job_record in &jobs {
                    if log_failed && matches!(job_record.status, seqrun::recorder::JobStatus::Passed) {
                        continue;
                    }
                    if let Ok(contents) = std::fs::read_to_string(&job_record.log_path) {
                        print!("{contents}");
                    }
                }
            } else {
                print!("{}", readmodel::render_view(&run, &jobs));
            }
            Ok(if exit_status { exit_code_for_run(engine, &run_id) } else { 0 })
        }
        RunAction::Watch {
            run_id,
            interval,
            exit_status,
            compact,
        } => {
            let run_id = resolve_run_id(engine, run_id)?;
            let final_run = engine.watch_run(&run_id, Duration::from_secs(interval.max(1)), |run, jobs| {
                if compact {
                    println!("{}", readmodel::render_list_line(run));
                } else {
                    print!("{}", readmodel::render_view(run, jobs));
                }
            })?;
            Ok(if exit_status { exit_code_for_run(engine, &final_run.run_id) } else { 0 })
        }
    }
}

fn resolve_run_id(engine: &Engine, run_id: Option<String>) -> Result<String, SeqError> {
    match run_id {
        Some(id) => Ok(id),
        None => engine
            .latest_run_id()?
            .ok_or_else(|| SeqError::RunNotFound("no runs recorded yet".to_string())),
    }
}
