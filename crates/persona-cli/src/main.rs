mod config;
mod engine;
mod session;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::RecognitionEngine;
use persona_core::{ModelRegistry, ProfileType};
use persona_hw::{Camera, V4l2Backend};
use rand::rngs::StdRng;
use rand::SeedableRng;
use session::{ProfileAssignment, ScanSession, SessionState};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::Instrument;

#[derive(Parser)]
#[command(name = "persona", about = "Facial profile recognition for environment presets")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan your face and assign a profile
    Scan {
        /// Scan attempts before giving up on "no face" / "not ready"
        #[arg(short, long, default_value_t = 3)]
        attempts: u32,
    },
    /// Choose a profile manually (name, slug or 1-4)
    Select { profile: ProfileType },
    /// List the available profiles
    Profiles,
    /// Load the recognition models and report their status
    Models,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Scan { attempts } => scan(&config, attempts.max(1), cli.json).await,
        Commands::Select { profile } => {
            let backend = V4l2Backend::new(&config.camera_device, config.warmup_frames);
            let mut session = ScanSession::with_engine(
                backend,
                config.capture_constraints(),
                RecognitionEngine::simulated(),
                config.reveal(),
                Box::new(StdRng::from_entropy()),
            );
            let assignment = session.select_manual(profile)?;
            session.close();
            print_assignment(&assignment, cli.json)
        }
        Commands::Profiles => {
            if cli.json {
                let list: Vec<_> = ProfileType::ALL
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.as_str(),
                            "slug": p.slug(),
                            "description": p.description(),
                            "characteristics": p.characteristics(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for (i, p) in ProfileType::ALL.iter().enumerate() {
                    println!("{}. {} ({})", i + 1, p, p.slug());
                    println!("   {}", p.description());
                    println!("   {}", p.characteristics());
                }
            }
            Ok(())
        }
        Commands::Models => {
            let mut registry = ModelRegistry::new(&config.model_dir);
            let state = registry.load().await;
            if cli.json {
                let report = serde_json::json!({
                    "dir": registry.base_dir(),
                    "state": state,
                    "models": registry.statuses(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Model directory: {}", registry.base_dir().display());
                for status in registry.statuses() {
                    let mark = if status.loaded { "ok" } else { "missing" };
                    print!("  {:<12} {:<8} {}", status.kind.name(), mark, status.path.display());
                    match &status.error {
                        Some(err) => println!(" ({err})"),
                        None => println!(),
                    }
                }
                println!("State: {state:?}");
            }
            Ok(())
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
    }
}

async fn scan(config: &Config, attempts: u32, json: bool) -> Result<()> {
    let backend = V4l2Backend::new(&config.camera_device, config.warmup_frames);
    let mut session = ScanSession::open(backend, config, Box::new(StdRng::from_entropy())).await;
    let span = tracing::info_span!("session", id = %session.id());

    if let Some(notice) = session.notice() {
        eprintln!("{notice}");
    }

    let teardown = session.teardown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            teardown.fire();
        }
    });

    let mut states = session.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                SessionState::Scanning => eprintln!("Analyzing face..."),
                SessionState::ResultShown(profile) => eprintln!("Profile detected: {profile}"),
                _ => {}
            }
        }
    });

    async move {
        if let Err(err) = session.start_camera() {
            eprintln!("{}", err.user_message());
            let stdin = BufReader::new(tokio::io::stdin());
            let Some(profile) = prompt_profile(stdin).await? else {
                session.close();
                anyhow::bail!(err);
            };
            let assignment = session.select_manual(profile)?;
            session.close();
            return print_assignment(&assignment, json);
        }

        let mut attempt = 1;
        let assignment = loop {
            let result = session.scan().await;
            match result {
                Ok(assignment) => break assignment,
                Err(err) if err.is_retryable() && attempt < attempts => {
                    eprintln!("{}", err.user_message());
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => {
                    eprintln!("{}", err.user_message());
                    session.close();
                    anyhow::bail!(err);
                }
            }
        };

        session.close();
        print_assignment(&assignment, json)
    }
    .instrument(span)
    .await
}

/// Ask for a profile by number, slug or name. `None` if the user skips.
async fn prompt_profile<R: AsyncBufRead + Unpin>(input: R) -> Result<Option<ProfileType>> {
    for (i, p) in ProfileType::ALL.iter().enumerate() {
        eprintln!("  {}. {}", i + 1, p);
    }
    let mut lines = input.lines();
    loop {
        eprint!("Select a profile (empty to skip): ");
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        match line.parse::<ProfileType>() {
            Ok(profile) => return Ok(Some(profile)),
            Err(err) => eprintln!("{err}"),
        }
    }
}

fn print_assignment(assignment: &ProfileAssignment, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(assignment)?);
        return Ok(());
    }

    let profile = assignment.profile;
    println!("Profile: {profile}");
    println!("  {}", profile.description());
    println!("  {}", profile.characteristics());
    println!("Source: {:?} (confidence {:?})", assignment.source, assignment.confidence);

    if let Some(detection) = &assignment.detection {
        if let Some(age) = detection.rounded_age() {
            println!("Age: ~{age}");
        }
        println!("Gender: {:?}", detection.gender);
        let top: Vec<String> = detection
            .expressions
            .top(3)
            .into_iter()
            .map(|(expr, p)| format!("{expr:?} {:.0}%", p * 100.0))
            .collect();
        println!("Expressions: {}", top.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prompt_retries_until_valid() {
        let input: &[u8] = b"kitchen\nelderly\n";
        let profile = prompt_profile(input).await.unwrap();
        assert_eq!(profile, Some(ProfileType::ElderlyPeople));
    }

    #[tokio::test]
    async fn test_prompt_skip() {
        assert_eq!(prompt_profile(&b"\n"[..]).await.unwrap(), None);
        assert_eq!(prompt_profile(&b""[..]).await.unwrap(), None);
    }
}
