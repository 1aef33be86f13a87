use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing::level_filters::LevelFilter;
use overlay_compose_lib::orchestration::orchestrator::{Action, Orchestrator};
use overlay_compose_lib::orchestration::ssh::SshExecutor;
use overlay_compose_lib::orchestration::Project;
use overlay_compose_lib::provisioning::vm_spec::CloudScope;
use overlay_compose_schemas::cli_models::Opts;
use overlay_compose_schemas::settings::CloudSettings;
use service_clients::openstack::{OpenStackAuth, OpenStackClient};


#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    std::process::exit(match run_app().await {
        Ok(_) => 0,
        Err(err) => {
            tracing::error!("{:#}", err);
            1
        }
    });
}

fn log_level(s: &str) -> anyhow::Result<LevelFilter> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(anyhow!("Unknown Log LevelFilter {}", s)),
    }
}

/// The CLI arguments are processed and the action is performed, failures are logged with their
/// causes and turned into a non zero exit code.
pub async fn run_app() -> Result<(), anyhow::Error> {
    // Invoke cli option parsing
    let opts: Opts = Opts::parse();
    let mut e = None;
    // Determine and set log level
    let level = match &opts.verbosity {
        None => LevelFilter::INFO,
        Some(x) => match log_level(x) {
            Ok(l) => l,
            Err(err) => {
                e = Some(err);
                LevelFilter::INFO
            }
        },
    };

    let stdout_log = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(stdout_log.with_filter(level))
        .init();
    e.map(|e| tracing::warn!("{}", e));

    let command = opts.sub_command.name();
    match parse_command(opts).await {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::error!("ERROR: {}", err);
            err.chain().skip(1).for_each(|cause| tracing::error!("because: {}", cause));
            Err(anyhow!("overlay-compose {command} did not complete"))
        }
    }
}

/// This is the entrypoint for all commands
pub async fn parse_command(opts: Opts) -> anyhow::Result<()> {
    let project = Project::load(&opts.input).await?;
    for line in project.describe()? {
        println!("{line}");
    }

    // the topology command never touches the cloud
    let Some(action) = Action::from_sub_command(&opts.sub_command) else {
        return Ok(());
    };

    let settings_path = opts.cloud_config.clone()
        .map(PathBuf::from)
        .unwrap_or_else(CloudSettings::default_location);
    let settings = CloudSettings::read(&settings_path).await
        .with_context(|| format!("reading cloud settings from {settings_path:?}"))?;
    tracing::trace!("cloud settings = {settings}");

    let client = OpenStackClient::new(OpenStackAuth {
        auth_url: settings.auth_url.clone(),
        username: settings.username.clone(),
        password: settings.password.clone(),
        project_name: settings.project_name.clone(),
        user_domain_name: settings.user_domain_name.clone(),
        project_domain_name: settings.project_domain_name.clone(),
    });
    let scope = CloudScope {
        project_name: settings.project_name.clone(),
        region: settings.region_name.clone(),
    };
    let orchestrator = Orchestrator::new(
        project,
        Arc::new(client),
        Arc::new(SshExecutor::default()),
        scope,
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after the current step");
            ctrl_c.cancel();
        }
    });
    let ctx = orchestrator.run_context(cancel);

    let report = orchestrator.run(action, &ctx).await
        .with_context(|| format!("running {}", opts.sub_command.name()))?;
    println!("{report}");

    let failed = report.failed_nodes();
    if !failed.is_empty() {
        bail!("{} of {} nodes failed: {}", failed.len(), report.nodes.len(), failed.join(", "));
    }
    Ok(())
}
