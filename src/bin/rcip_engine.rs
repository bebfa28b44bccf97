use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use rcip_engine::progress::{ProgressEvent, ProgressKind};
use rcip_engine::safety::SafetyLevel;
use rcip_engine::{EngineConfig, ExecutionSession, Recipe, SimKitchen, StepExecutionState, StepState, StopReport};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("rcip-engine")
        .version("0.1.0")
        .author("Kitchen Systems Engineering Team")
        .about("🍳 RCIP step execution engine - sensor-driven recipe runs on a simulated kitchen")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Engine configuration (JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("▶️  Run a recipe against the simulated kitchen")
                .long_about("Dispatches every step, streams progress, and stops all devices on abort (Ctrl+C) or a safety veto")
                .arg(
                    Arg::with_name("recipe")
                        .help("Recipe document (JSON)")
                        .required(true),
                )
                .arg(
                    Arg::with_name("speed")
                        .short("s")
                        .long("speed")
                        .value_name("FACTOR")
                        .help("Simulated physics runs this many times faster than the wall clock")
                        .takes_value(true)
                        .default_value("1")
                        .validator(|v| match v.parse::<f64>() {
                            Ok(f) if f > 0.0 => Ok(()),
                            _ => Err("Speed must be a positive number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("🔍 Preflight every step without touching a device")
                .long_about("Checks capabilities, sensor coverage, inventory and reachability of each step's done_when")
                .arg(
                    Arg::with_name("recipe")
                        .help("Recipe document (JSON)")
                        .required(true),
                ),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let format = matches.value_of("format").unwrap_or("table").to_string();
    let config = match matches.value_of("config") {
        Some(path) => EngineConfig::from_file(Path::new(path))?,
        None => EngineConfig::default(),
    };

    match matches.subcommand() {
        ("run", Some(sub)) => handle_run(sub, config, &format).await?,
        ("check", Some(sub)) => handle_check(sub, config, &format)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Preflight a recipe", "rcip-engine check demos/recipe.json".bright_cyan());
            println!("  {} Run it", "rcip-engine run demos/recipe.json --speed 20".bright_cyan());
        }
    }

    Ok(())
}

fn load_recipe(matches: &ArgMatches<'_>) -> Result<Recipe, Box<dyn std::error::Error>> {
    let path = matches.value_of("recipe").unwrap_or_default();
    let json = std::fs::read_to_string(path)?;
    Ok(Recipe::from_json_str(&json)?)
}

async fn handle_run(
    matches: &ArgMatches<'_>,
    config: EngineConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let recipe = load_recipe(matches)?;
    let speed = matches
        .value_of("speed")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(1.0);

    let kitchen = Arc::new(SimKitchen::from_recipe(&recipe).with_time_scale(speed));
    let session = ExecutionSession::builder(config, kitchen.clone(), kitchen.clone())
        .recipe(&recipe)
        .build()?;

    if format == "table" {
        println!("{}", "🍳 RCIP Engine - simulated kitchen".bright_blue().bold());
        println!(
            "{} {} steps, {} devices, physics x{}",
            "Running".dimmed(),
            recipe.steps.len(),
            recipe.device_profiles.len(),
            speed
        );
    }

    let mut stream = session.subscribe();
    let printer_format = format.to_string();
    let printer = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            print_event(&event, &printer_format);
        }
    });

    let result = {
        let run = session.run_recipe(&recipe.steps);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping all devices");
                let report = session.abort("operator interrupt").await;
                print_stop_report(&report, format);
                run.await
            }
        }
    };

    let safety_events = session.safety_events();
    drop(session);
    if let Err(e) = printer.await {
        warn!(error = %e, "progress printer failed");
    }

    match result {
        Ok(states) => {
            print_results(&states, format);
            info!(steps = states.len(), "recipe run finished");
        }
        Err(e) => {
            println!("{} {}", "⛔".red(), format!("Recipe stopped: {e}").bright_red().bold());
            for event in safety_events.iter().filter(|e| e.level >= SafetyLevel::Critical) {
                let reading = match (event.value, event.limit) {
                    (Some(value), Some(limit)) => format!(" ({value:.2} > {limit:.2})"),
                    _ => String::new(),
                };
                println!("  {} {:?} on {}{}", "•".red(), event.event, event.origin, reading);
            }
            let stops = kitchen.stops();
            if !stops.is_empty() {
                println!("{} {}", "Stopped:".bright_white(), stops.join(", ").bright_cyan());
            }
            std::process::exit(2);
        }
    }
    Ok(())
}

fn handle_check(
    matches: &ArgMatches<'_>,
    config: EngineConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let recipe = load_recipe(matches)?;
    let kitchen = Arc::new(SimKitchen::from_recipe(&recipe));
    let session = ExecutionSession::builder(config, kitchen.clone(), kitchen)
        .recipe(&recipe)
        .build()?;

    let mut failures = 0;
    for step in &recipe.steps {
        let verdict = session.preflight(step);
        if verdict.is_err() {
            failures += 1;
        }
        match format {
            "json" => {
                let value = serde_json::json!({
                    "step_id": step.id,
                    "ok": verdict.is_ok(),
                    "error": verdict.as_ref().err().map(ToString::to_string),
                });
                println!("{value}");
            }
            "compact" => match &verdict {
                Ok(()) => println!("{} OK", step.id),
                Err(e) => println!("{} FAIL {}", step.id, e),
            },
            _ => match &verdict {
                Ok(()) => println!("{} {}", "✅".green(), step.id.bright_white()),
                Err(e) => println!(
                    "{} {} {}",
                    "❌".red(),
                    step.id.bright_white(),
                    e.to_string().bright_red()
                ),
            },
        }
    }

    if format == "table" {
        if failures == 0 {
            println!("{}", "All steps pass preflight".bright_green());
        } else {
            println!("{}", format!("{failures} step(s) would fail").yellow());
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn colored_state(state: StepState) -> ColoredString {
    let label = format!("{state:?}");
    match state {
        StepState::Completed => label.bright_green(),
        StepState::Failed => label.bright_red(),
        StepState::Aborted => label.red().bold(),
        StepState::Monitoring => label.bright_cyan(),
        StepState::Dispatched => label.bright_blue(),
        StepState::Pending => label.dimmed(),
    }
}

fn print_event(event: &ProgressEvent, format: &str) {
    match format {
        "json" => match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "unserializable progress event"),
        },
        "compact" => println!("{}", event.summary()),
        _ => match &event.kind {
            ProgressKind::Transition => println!(
                "{} {:>9} {} {}",
                "→".bright_blue(),
                format!("{}ms", event.timestamp_ms).dimmed(),
                event.step_id.bright_white(),
                colored_state(event.state)
            ),
            ProgressKind::Tick => println!("  {}", event.summary().dimmed()),
            ProgressKind::Warning(w) => println!("{} {}", "⚠️ ".yellow(), w.to_string().yellow()),
            ProgressKind::Safety(level) => println!(
                "{} {} safety level {:?}",
                "🛡️ ".bright_red(),
                event.step_id.bright_white(),
                level
            ),
        },
    }
}

fn print_stop_report(report: &StopReport, format: &str) {
    match format {
        "json" => match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "unserializable stop report"),
        },
        _ => {
            println!(
                "{} {}",
                "Stop acknowledged:".bright_white(),
                report.acknowledged.join(", ").bright_green()
            );
            if !report.unresponsive.is_empty() {
                println!(
                    "{} {}",
                    "Unresponsive:".bright_red().bold(),
                    report.unresponsive.join(", ").bright_red()
                );
            }
        }
    }
}

fn print_results(states: &[StepExecutionState], format: &str) {
    match format {
        "json" => match serde_json::to_string_pretty(states) {
            Ok(doc) => println!("{doc}"),
            Err(e) => warn!(error = %e, "unserializable results"),
        },
        "compact" => {
            for exec in states {
                println!("{} {:?}", exec.step_id, exec.state);
            }
        }
        _ => {
            println!();
            println!("{}", "📋 Results".bright_blue().bold());
            println!("{:<16} {:<12} {:>6} {:>8}  {}", "STEP", "STATE", "TICKS", "WARN", "DETAIL");
            for exec in states {
                let detail = exec
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                println!(
                    "{:<16} {:<12} {:>6} {:>8}  {}",
                    exec.step_id,
                    colored_state(exec.state),
                    exec.ticks,
                    exec.warnings.len(),
                    detail.bright_red()
                );
            }
        }
    }
}
