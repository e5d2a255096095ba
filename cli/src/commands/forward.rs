//! Forward command - run a forwarding session until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use devforward_core::adapters::PidFileProcessManager;
use devforward_core::{
    parse_port_forward_flag, scraper, ContainerComponent, ExecPortForwarder, ForwardingConfig,
    ForwardingService, KubePortForwarder, Platform, RelaySettings, StartOptions, StartOutcome,
    StateStore, TunnelBackend,
};

pub struct ForwardArgs {
    pub component: String,
    pub file: PathBuf,
    pub platform: Platform,
    pub debug: bool,
    pub random_ports: bool,
    pub port_forward: Vec<String>,
}

pub async fn run(config: &ForwardingConfig, args: ForwardArgs) -> Result<()> {
    let content = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let containers: Vec<ContainerComponent> = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", args.file.display()))?;

    let options = StartOptions {
        debug: args.debug,
        random_ports: args.random_ports,
        defined_ports: parse_port_forward_flag(&args.port_forward)?,
    };
    let store = Arc::new(StateStore::for_current_process(&config.state_dir, args.platform));
    let client = super::kubectl(config)?;

    match args.platform {
        Platform::Cluster => {
            let backend =
                KubePortForwarder::new(client, Arc::clone(&store), scraper::stdout_output(), config);
            let service =
                ForwardingService::new(backend, store, config.base_port, config.port_range);
            run_session(service, &args.component, &containers, options).await
        }
        Platform::Podman => {
            let manager = PidFileProcessManager::new(client, config.pid_dir.clone());
            let backend = ExecPortForwarder::new(
                manager,
                Arc::clone(&store),
                scraper::stdout_output(),
                RelaySettings::from_config(config),
            );
            let service =
                ForwardingService::new(backend, store, config.base_port, config.port_range);
            run_session(service, &args.component, &containers, options).await
        }
    }
}

async fn run_session<B: TunnelBackend>(
    service: ForwardingService<B>,
    component: &str,
    containers: &[ContainerComponent],
    options: StartOptions,
) -> Result<()> {
    service.init().await?;

    let outcome = match service
        .start_port_forwarding(component, containers, options)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            service.shutdown().await?;
            return Err(e.into());
        }
    };
    if outcome == StartOutcome::NoEndpoints {
        println!("No endpoint to forward for {component}.");
        service.shutdown().await?;
        return Ok(());
    }

    println!(
        "[{}] Port forwarding on {} is active. Press Ctrl+C to stop.",
        chrono::Local::now().format("%H:%M:%S"),
        service.platform()
    );
    let mut persist_errors = service.persist_errors();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = persist_errors.changed() => {
                if changed.is_err() {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                if let Some(error) = persist_errors.borrow_and_update().clone() {
                    eprintln!("Warning: forwarded ports could not be saved: {error}");
                }
            }
        }
    }

    println!("\nStopping port forwarding...");
    service.shutdown().await?;
    Ok(())
}
