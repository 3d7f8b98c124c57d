use std::io::Write;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::CommandFactory;
use relaunch_core::{FailureStage, UpdaterConfig};
use relaunch_installer::{
    ArtifactInstaller, FileVersionStore, HttpFetcher, InstallPlan, InstallRecord, RunLock,
    StateLayout,
};
use relaunch_registry::GithubReleases;
use relaunch_service::{
    HealthProbe, LogHealthProbe, ServiceController, ServiceSettings, ServiceStatus,
    SystemdController,
};
use tracing::{debug, info};

use crate::notify::{ConsoleNotifier, Notifiers, WebhookNotifier};
use crate::render::{current_output_style, OutputStyle, TerminalProgress, TerminalRenderer};
use crate::update_flow::{Rollback, RollbackOutcome, RunMode, RunOutcome, Updater};
use crate::{Cli, Commands};

const WEBHOOK_ENV_VARS: [&str; 2] = ["RELAUNCH_WEBHOOK_URL", "DISCORD_WEBHOOK_URL"];

pub(crate) fn run_cli(cli: Cli) -> Result<u8> {
    let command = match cli.command {
        Commands::Completions { shell } => return print_completions(shell),
        Commands::Run => ConfiguredCommand::Run,
        Commands::Check => ConfiguredCommand::Check,
        Commands::Status => ConfiguredCommand::Status,
        Commands::Verify { window } => ConfiguredCommand::Verify { window },
        Commands::Rollback => ConfiguredCommand::Rollback,
    };

    let config = UpdaterConfig::from_path(&cli.config)?;
    let layout = StateLayout::from_config(&config);
    debug!(
        config = %cli.config.display(),
        state_dir = %layout.state_dir().display(),
        install_path = %layout.install_path().display(),
        "loaded configuration"
    );

    match command {
        ConfiguredCommand::Run => run_update(&config, &layout, RunMode::Apply),
        ConfiguredCommand::Check => run_update(&config, &layout, RunMode::CheckOnly),
        ConfiguredCommand::Status => {
            let store = FileVersionStore::new(layout.clone());
            let service = SystemdController::new(ServiceSettings::from_config(&config));
            let report = StatusReport {
                record: store.read_record()?,
                last_check_unix: store.last_check()?,
                service: service.status(),
                lock_holder: RunLock::holder(&layout)?,
                previous_kept: layout.previous_binary_path().exists(),
            };
            TerminalRenderer::current().print_lines(&format_status_lines(&config, &report));
            Ok(0)
        }
        ConfiguredCommand::Verify { window } => {
            let window = window
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.timeouts.health_window());
            let mut probe = LogHealthProbe::journal(&config)?;
            let renderer = TerminalRenderer::current();
            renderer.print_status(
                "step",
                &format!(
                    "watching {} for {}s",
                    config.service_name,
                    window.as_secs()
                ),
            );
            let result = probe.verify(window);
            match result.into_error(window) {
                None => {
                    renderer.print_status("ok", &format!("{} is healthy", config.service_name));
                    Ok(0)
                }
                Some(err) => {
                    renderer.print_status("err", &err.to_string());
                    Ok(FailureStage::Health.exit_code())
                }
            }
        }
        ConfiguredCommand::Rollback => run_rollback(&config, &layout),
    }
}

/// Subcommands that need the config file loaded.
enum ConfiguredCommand {
    Run,
    Check,
    Status,
    Verify { window: Option<u64> },
    Rollback,
}

fn print_completions(shell: clap_complete::Shell) -> Result<u8> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "relaunch", &mut generated);
    std::io::stdout()
        .write_all(&generated)
        .context("failed writing completion script")?;
    Ok(0)
}

fn run_update(config: &UpdaterConfig, layout: &StateLayout, mode: RunMode) -> Result<u8> {
    let style = current_output_style();
    let _lock = match mode {
        RunMode::Apply => Some(RunLock::acquire(layout)?),
        RunMode::CheckOnly => {
            layout.ensure_base_dirs()?;
            None
        }
    };

    let notifier = build_notifiers(config, style, mode)?;
    let source = GithubReleases::new(&config.registry_url, &config.repo, config.timeouts.http())?
        .with_token(std::env::var("GITHUB_TOKEN").ok());
    let store = FileVersionStore::new(layout.clone());
    let service = SystemdController::new(ServiceSettings::from_config(config));
    let fetcher = HttpFetcher::new(config.timeouts.download())?
        .with_observer(Box::new(TerminalProgress::new(style)));
    let installer = ArtifactInstaller::new(layout.clone(), InstallPlan::from_config(config), fetcher);
    let mut probe = LogHealthProbe::journal(config)?;

    let outcome = Updater {
        source: &source,
        store: &store,
        service: &service,
        installer: &installer,
        probe: &mut probe,
        notifier: &notifier,
        health_window: config.timeouts.health_window(),
    }
    .run(mode);

    match &outcome {
        RunOutcome::NoUpdate { current } => debug!(current = %current, "already on latest release"),
        RunOutcome::Available { current, latest } => {
            let current = current
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string());
            TerminalRenderer::from_style(style)
                .print_status("step", &format!("update available: {current} -> {latest}"));
        }
        RunOutcome::Updated { old, new } => debug!(old = ?old, new = %new, "update applied"),
        RunOutcome::Failed {
            stage,
            error,
            rolled_back,
        } => info!(
            stage = %stage,
            kind = error.kind(),
            rolled_back,
            "update run finished with failure"
        ),
    }
    Ok(outcome.exit_code())
}

fn run_rollback(config: &UpdaterConfig, layout: &StateLayout) -> Result<u8> {
    let _lock = RunLock::acquire(layout)?;
    if !layout.previous_binary_path().exists() {
        return Err(anyhow!(
            "no previous binary kept at {}",
            layout.previous_binary_path().display()
        ));
    }

    let style = current_output_style();
    let notifier = build_notifiers(config, style, RunMode::Apply)?;
    let store = FileVersionStore::new(layout.clone());
    let service = SystemdController::new(ServiceSettings::from_config(config));
    let fetcher = HttpFetcher::new(config.timeouts.download())?;
    let installer = ArtifactInstaller::new(layout.clone(), InstallPlan::from_config(config), fetcher);

    let outcome = Rollback {
        store: &store,
        service: &service,
        installer: &installer,
        notifier: &notifier,
    }
    .run();

    if let RollbackOutcome::Restored { version } = &outcome {
        let version = version
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unrecorded version".to_string());
        TerminalRenderer::from_style(style).print_status(
            "ok",
            &format!(
                "restored previous binary ({version}) at {}",
                layout.install_path().display()
            ),
        );
    }
    Ok(outcome.exit_code())
}

fn build_notifiers(config: &UpdaterConfig, style: OutputStyle, mode: RunMode) -> Result<Notifiers> {
    let mut notifiers = Notifiers::default().with(Box::new(ConsoleNotifier::new(style)));
    let webhook = resolve_webhook_url(config.notify.webhook_url.as_deref(), |key| {
        std::env::var(key).ok()
    });
    if let (Some(url), RunMode::Apply) = (webhook, mode) {
        notifiers = notifiers.with(Box::new(WebhookNotifier::new(&url)?));
    }
    debug!(sinks = notifiers.len(), "notification sinks ready");
    Ok(notifiers)
}

/// Environment wins over the config file; blank values are ignored.
pub(crate) fn resolve_webhook_url<F>(configured: Option<&str>, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    WEBHOOK_ENV_VARS
        .iter()
        .find_map(|key| env(key))
        .or_else(|| configured.map(str::to_string))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

pub(crate) struct StatusReport {
    pub(crate) record: Option<InstallRecord>,
    pub(crate) last_check_unix: Option<u64>,
    pub(crate) service: ServiceStatus,
    pub(crate) lock_holder: Option<u32>,
    pub(crate) previous_kept: bool,
}

pub(crate) fn format_status_lines(config: &UpdaterConfig, report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!("repo: {}", config.repo),
        format!("binary: {}", config.install_path.display()),
    ];
    match &report.record {
        Some(record) => {
            let installed_at = record
                .installed_at_unix
                .map(|at| format!(" (installed_at_unix={at})"))
                .unwrap_or_default();
            lines.push(format!("version: {}{installed_at}", record.version));
        }
        None => lines.push("version: none recorded".to_string()),
    }
    lines.push(format!(
        "last check: {}",
        report
            .last_check_unix
            .map(|at| format!("unix={at}"))
            .unwrap_or_else(|| "never".to_string())
    ));
    lines.push(format!("service {}: {}", config.service_name, report.service));
    lines.push(format!(
        "previous binary: {}",
        if report.previous_kept { "kept" } else { "none" }
    ));
    lines.push(match report.lock_holder {
        Some(pid) => format!("lock: held by pid={pid}"),
        None => "lock: free".to_string(),
    });
    lines
}
