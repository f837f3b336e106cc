#![deny(missing_docs)]

//! CLI binary interface for dsr

use clap::Parser;
use dsr::envelope::{self, CommandRun};
use dsr::errors::{DsrError, DsrResult};
use dsr::plan::PlanFilters;
use dsr::platform::TargetPair;
use dsr::{BuildOptions, CommandOutcome, Session};
use serde_json::json;
use tracing::error;

use cli::{
    Cli, Commands, HealthCommands, PruneArgs, ReleaseCommands, ReposCommands, WatchArgs,
};

mod cli;

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(64)
        .enable_all()
        .build()
        .expect("Initializing tokio runtime failed");

    // the watch loop emits one envelope per iteration; everything else
    // emits exactly one per process
    if let Commands::Watch(args) = &cli.command {
        if !args.once {
            let code = runtime.block_on(watch_loop(&cli, args));
            std::process::exit(code as i32);
        }
    }

    let run = CommandRun::start(command_name(&cli.command));
    let result = runtime.block_on(real_main(&cli));
    let (exit_code, details) = match result {
        Ok(outcome) => (outcome.exit_code, outcome.details),
        Err(err) => {
            let code = err.exit_code();
            let details = json!({"error": err.to_string()});
            eprintln!("{:?}", miette::Report::new(err));
            (code, details)
        }
    };
    finish(&cli, &run, exit_code, details);
    std::process::exit(exit_code as i32);
}

fn init_tracing(cli: &Cli) {
    // an explicit -v wins; DSR_LOG_LEVEL covers the no-flag case
    let level = if cli.verbose != tracing::level_filters::LevelFilter::WARN {
        cli.verbose
    } else {
        std::env::var("DSR_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cli.verbose)
    };
    let builder = tracing_subscriber::fmt::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json {
        builder.json().init();
    } else {
        builder
            .without_time()
            .with_ansi(console::colors_enabled_stderr())
            .init();
    }
}

fn finish(cli: &Cli, run: &CommandRun, exit_code: u8, details: serde_json::Value) {
    let env = run.finish(exit_code, details);
    if cli.json {
        envelope::emit(&env);
    } else {
        print_human(&env);
    }
}

fn print_human(env: &dsr_schema::Envelope) {
    match env.exit_code {
        0 => println!("{}: ok", env.command),
        code => println!("{}: {:?} (exit {code})", env.command, env.status),
    }
    if let Some(error) = env.details.get("error").and_then(|e| e.as_str()) {
        println!("  {error}");
    }
    if let Some(count) = env.details.get("artifacts_count") {
        println!("  artifacts: {count}");
    }
    if let Some(names) = env.details.get("artifacts").and_then(|a| a.as_array()) {
        for name in names {
            if let Some(name) = name.as_str() {
                println!("    {name}");
            }
        }
    }
    if let Some(problems) = env.details.get("problems").and_then(|p| p.as_array()) {
        for problem in problems {
            if let Some(problem) = problem.as_str() {
                println!("  problem: {problem}");
            }
        }
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Build(_) => "build",
        Commands::Release(args) => match &args.command {
            Some(ReleaseCommands::Verify(_)) => "release-verify",
            None => "release",
        },
        Commands::Fallback(_) => "fallback",
        Commands::Watch(_) => "watch",
        Commands::Doctor(_) => "doctor",
        Commands::Health(_) => "health",
        Commands::Prune(_) => "prune",
        Commands::Quality(_) => "quality",
        Commands::Repos(_) => "repos",
        Commands::Status => "status",
        Commands::Version => "version",
    }
}

fn parse_targets(args: &cli::BuildArgs) -> DsrResult<Option<Vec<TargetPair>>> {
    let mut pairs = Vec::new();
    for raw in args.target.iter().chain(args.targets.iter()) {
        pairs.push(raw.parse()?);
    }
    Ok((!pairs.is_empty()).then_some(pairs))
}

fn build_options(cli: &Cli, args: &cli::BuildArgs, force_native: bool) -> DsrResult<BuildOptions> {
    Ok(BuildOptions {
        tool: args.tool.clone(),
        version: args.version.clone(),
        filters: PlanFilters {
            targets: parse_targets(args)?,
            only_act: args.only_act,
            only_native: args.only_native,
            force_native,
        },
        dry_run: cli.dry_run,
        draft: args.draft.then_some(true),
        parallel: args.parallel,
        sync_only: args.sync_only,
        no_sync: args.no_sync,
        reuse_artifacts: args.reuse_artifacts,
        no_cache: args.no_cache,
        artifacts_dir: args.artifacts.clone(),
        skip_publish: args.no_release,
    })
}

async fn real_main(cli: &Cli) -> DsrResult<CommandOutcome> {
    if matches!(cli.command, Commands::Version) {
        return Ok(CommandOutcome::success(
            json!({"dsr": env!("CARGO_PKG_VERSION")}),
        ));
    }

    let session = Session::load()?;
    match &cli.command {
        Commands::Build(args) => {
            let opts = build_options(cli, args, false)?;
            dsr::do_build(&session, &opts).await
        }
        Commands::Fallback(args) => {
            let opts = build_options(cli, args, true)?;
            dsr::do_fallback(&session, &opts).await
        }
        Commands::Release(args) => match &args.command {
            Some(ReleaseCommands::Verify(verify)) => {
                dsr::do_release(
                    &session,
                    &verify.tool,
                    verify.version.as_deref(),
                    true,
                    verify.fix,
                    verify.checksums,
                    None,
                )
                .await
            }
            None => {
                let tool = args.tool.as_deref().ok_or_else(|| DsrError::InvalidArgs {
                    reason: "release requires --tool".to_owned(),
                })?;
                dsr::do_release(
                    &session,
                    tool,
                    args.version.as_deref(),
                    false,
                    false,
                    false,
                    args.draft.then_some(true),
                )
                .await
            }
        },
        Commands::Watch(args) => {
            // only the --once form reaches here
            dsr::do_watch(&session, args.tool.as_deref(), cli.dry_run).await
        }
        Commands::Doctor(args) => dsr::do_doctor(&session, args.quick, args.fix),
        Commands::Health(args) => match &args.command {
            HealthCommands::Check { host, no_cache } => {
                dsr::do_health(&session, Some(host), false, *no_cache)
            }
            HealthCommands::All { no_cache } => dsr::do_health(&session, None, false, *no_cache),
            HealthCommands::ClearCache => dsr::do_health(&session, None, true, false),
        },
        Commands::Prune(args) => prune(cli, &session, args),
        Commands::Quality(args) => {
            dsr::do_quality(&session, &args.tool, cli.dry_run, args.skip_checks)
        }
        Commands::Repos(args) => match &args.command {
            ReposCommands::List => dsr::do_repos(&session, false, None),
            ReposCommands::Validate { tool } => dsr::do_repos(&session, true, tool.as_deref()),
        },
        Commands::Status => dsr::do_status(&session),
        Commands::Version => unreachable!("handled before loading a session"),
    }
}

fn prune(cli: &Cli, session: &Session, args: &PruneArgs) -> DsrResult<CommandOutcome> {
    // destructive only under --force; everything else is a report
    let dry_run = cli.dry_run || !args.force;
    dsr::do_prune(session, args.max_age, args.keep_last, dry_run)
}

/// The looping form of `dsr watch`: one envelope per iteration until
/// interrupted
async fn watch_loop(cli: &Cli, args: &WatchArgs) -> u8 {
    let interval = match Session::load() {
        Ok(session) => session.snapshot.settings.watch_interval_secs,
        Err(_) => 300,
    };
    loop {
        let run = CommandRun::start("watch");
        let (exit_code, details) = match Session::load() {
            Ok(session) => {
                match dsr::do_watch(&session, args.tool.as_deref(), cli.dry_run).await {
                    Ok(outcome) => (outcome.exit_code, outcome.details),
                    Err(err) => {
                        error!("watch iteration failed: {err}");
                        (err.exit_code(), json!({"error": err.to_string()}))
                    }
                }
            }
            Err(err) => (err.exit_code(), json!({"error": err.to_string()})),
        };
        finish(cli, &run, exit_code, details);

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = tokio::signal::ctrl_c() => return 0,
        }
    }
}
