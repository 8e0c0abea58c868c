mod bridge;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stride_bot_core::agent::{Agent, AgentDeps};
use stride_bot_core::catalog::events::{EventCatalog, EventPrefs};
use stride_bot_core::catalog::races::RaceIndex;
use stride_bot_core::catalog::skills::{SkillCatalog, SkillMatcher};
use stride_bot_core::config::{Config, ConfigLoader};
use stride_bot_core::memory::{PalMemory, SkillMemory};
use stride_bot_core::{PollConfig, StopFlag, Waiter};

use bridge::{BridgeClient, RemoteBridgeController, RemotePerception};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn load_catalog_json(dir: &str, file: &str) -> Option<String> {
    let path = std::path::Path::new(dir).join(file);
    std::fs::read_to_string(path).ok()
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    // Defaults from environment variables, overridable with `--flag value`.
    let mut bridge_addr = env_or("STRIDE_BOT_BRIDGE_ADDR", "127.0.0.1:7878");
    let mut config_file = env_or("STRIDE_BOT_CONFIG", "stride-bot.toml");
    let mut data_dir = env_or("STRIDE_BOT_DATA_DIR", "datasets");
    let mut prefs_dir = env_or("STRIDE_BOT_PREFS_DIR", "prefs");
    let mut tick_ms: u64 = std::env::var("STRIDE_BOT_TICK_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(400);
    let mut poll_interval_ms: u64 = std::env::var("STRIDE_BOT_POLL_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(250);
    let mut max_iterations: Option<u64> = None;

    apply_runner_cli_overrides(
        std::env::args().skip(1),
        &mut bridge_addr,
        &mut config_file,
        &mut data_dir,
        &mut prefs_dir,
        &mut tick_ms,
        &mut poll_interval_ms,
        &mut max_iterations,
    )?;

    let config: Config = ConfigLoader::parse_from_file(&config_file)
        .with_context(|| format!("load config {config_file}"))?;
    if !config.general.scenario_confirmed {
        info!(
            "[agent] scenario not confirmed in config; proceeding with {}",
            config.general.scenario.as_str()
        );
    }
    let scenario = config.general.scenario.as_str().to_string();

    // Read-only catalogs; missing files degrade to empty lookups.
    let skill_catalog = load_catalog_json(&data_dir, "skills.json")
        .and_then(|t| SkillCatalog::load_json(&t).ok())
        .unwrap_or_default();
    let race_index = load_catalog_json(&data_dir, "races.json")
        .and_then(|t| RaceIndex::load_json(&t).ok())
        .unwrap_or_default();
    let event_catalog = load_catalog_json(&data_dir, "events.json")
        .and_then(|t| EventCatalog::load_json(&t).ok())
        .unwrap_or_default();
    info!(
        "[agent] catalogs loaded: events={} (data dir {})",
        event_catalog.len(),
        data_dir
    );

    // Persistent memories, write-through, per scenario.
    let prefs = std::path::PathBuf::from(&prefs_dir);
    let skill_memory = SkillMemory::load(prefs.join("runtime_skill_memory.json"), &scenario);
    let pal_memory = PalMemory::load(prefs.join("runtime_pal_memory.json"), &scenario);

    // Stop control: this thread owns stdin; any line toggles the shared stop
    // flag (a desktop hotkey hook would feed the same flag).
    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                info!("[agent] stop toggle received");
                stop.request_stop();
            }
        });
    }

    let read_timeout = Duration::from_millis(poll_interval_ms.saturating_mul(2).max(100));
    let client = Rc::new(RefCell::new(BridgeClient::connect(
        &bridge_addr,
        read_timeout,
    )?));
    let controller = RemoteBridgeController::new(client.clone());
    let perception = RemotePerception::new(client);

    let poll = PollConfig {
        interval: Duration::from_millis(poll_interval_ms),
        timeout: Duration::from_secs(4),
        agent: scenario.clone(),
    };
    let waiter = Waiter::new(Box::new(controller), Box::new(perception), poll, stop);

    let mut agent = Agent::new(AgentDeps {
        waiter,
        config,
        skill_matcher: SkillMatcher::new(skill_catalog),
        race_index,
        event_catalog,
        event_prefs: EventPrefs::default(),
        skill_memory,
        pal_memory,
    })?;

    match agent.run(Duration::from_millis(tick_ms), max_iterations) {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("[agent] fatal: {err:#}");
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_runner_cli_overrides(
    args: impl IntoIterator<Item = String>,
    bridge_addr: &mut String,
    config_file: &mut String,
    data_dir: &mut String,
    prefs_dir: &mut String,
    tick_ms: &mut u64,
    poll_interval_ms: &mut u64,
    max_iterations: &mut Option<u64>,
) -> anyhow::Result<()> {
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if !arg.starts_with("--") {
            eprintln!("Unexpected positional argument: {arg}");
            continue;
        }
        let flag = arg.trim_start_matches("--");
        let Some(val) = it.next() else {
            anyhow::bail!("Expected value after flag: --{flag}");
        };
        match flag {
            "bridge-addr" => *bridge_addr = val,
            "config" => *config_file = val,
            "data-dir" => *data_dir = val,
            "prefs-dir" => *prefs_dir = val,
            "tick-ms" => {
                *tick_ms = val
                    .parse()
                    .with_context(|| format!("tick-ms must be a number, got: {val}"))?;
            }
            "poll-interval-ms" => {
                *poll_interval_ms = val
                    .parse()
                    .with_context(|| format!("poll-interval-ms must be a number, got: {val}"))?;
            }
            "max-iterations" => {
                *max_iterations = Some(
                    val.parse()
                        .with_context(|| format!("max-iterations must be a number, got: {val}"))?,
                );
            }
            _ => eprintln!("Unknown flag: --{flag}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_cli_overrides_apply() {
        let mut bridge_addr = "127.0.0.1:7878".to_string();
        let mut config_file = "stride-bot.toml".to_string();
        let mut data_dir = "datasets".to_string();
        let mut prefs_dir = "prefs".to_string();
        let mut tick_ms: u64 = 400;
        let mut poll_interval_ms: u64 = 250;
        let mut max_iterations: Option<u64> = None;

        apply_runner_cli_overrides(
            vec![
                "--bridge-addr".to_string(),
                "10.0.0.2:9999".to_string(),
                "--config".to_string(),
                "alt.toml".to_string(),
                "--tick-ms".to_string(),
                "123".to_string(),
                "--max-iterations".to_string(),
                "5".to_string(),
            ],
            &mut bridge_addr,
            &mut config_file,
            &mut data_dir,
            &mut prefs_dir,
            &mut tick_ms,
            &mut poll_interval_ms,
            &mut max_iterations,
        )
        .unwrap();

        assert_eq!(bridge_addr, "10.0.0.2:9999");
        assert_eq!(config_file, "alt.toml");
        assert_eq!(data_dir, "datasets");
        assert_eq!(prefs_dir, "prefs");
        assert_eq!(tick_ms, 123);
        assert_eq!(poll_interval_ms, 250);
        assert_eq!(max_iterations, Some(5));
    }

    #[test]
    fn runner_cli_rejects_missing_value() {
        let mut bridge_addr = String::new();
        let mut config_file = String::new();
        let mut data_dir = String::new();
        let mut prefs_dir = String::new();
        let mut tick_ms = 0u64;
        let mut poll_interval_ms = 0u64;
        let mut max_iterations = None;

        let err = apply_runner_cli_overrides(
            vec!["--tick-ms".to_string()],
            &mut bridge_addr,
            &mut config_file,
            &mut data_dir,
            &mut prefs_dir,
            &mut tick_ms,
            &mut poll_interval_ms,
            &mut max_iterations,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("tick-ms"));
    }
}
