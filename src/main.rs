use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use foreman::agent::Agent;
use foreman::agent::config::{AgentConfig, AgentHome};
use foreman::args::AgentArgs;
use foreman::logger;
use foreman::properties::{self, Properties};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

fn main() -> Result<(), Box<dyn Error>> {
    let args = AgentArgs::parse();
    logger::init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut base_properties = match args.properties.as_deref() {
            Some(path) => Properties::load(Path::new(path))?,
            None => Properties::new(),
        };
        if let Some(host) = args.console_host.as_deref() {
            base_properties.set(properties::CONSOLE_HOST, host);
        }
        if let Some(port) = args.console_port {
            base_properties.set(properties::CONSOLE_PORT, &port.to_string());
        }

        let home = AgentHome::new(Path::new(&args.home))?;
        let config = AgentConfig::new(home, base_properties.clone());
        let agent = Arc::new(Agent::new(config, args.proceed_without_console));

        let signal_agent = Arc::clone(&agent);
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            signal_agent.shutdown();
        });

        agent.run(base_properties).await?;
        Ok(())
    })
}

async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        let mut term_signal = match signal(SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(err) => {
                eprintln!("Failed to register SIGTERM handler: {}", err);
                None
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = async {
                if let Some(signal) = term_signal.as_mut() {
                    signal.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
        }
    }

    #[cfg(not(unix))]
    {
        drop(tokio::signal::ctrl_c().await);
    }
}
