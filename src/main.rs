use std::{error::Error, process::exit};

use kube_client::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config as ClientConfig,
};
use log::{error, info};
use secret_deployer::Config;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    configure_logger();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Couldn't load configuration! {err}");
            exit(1)
        }
    };
    let client = create_client().await;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    secret_deployer::run(client, config, shutdown).await?;
    info!("Stopped");

    Ok(())
}

/// Prefers the in-cluster service account, then falls back to the kubeconfig
/// at `$KUBECONFIG` or `~/.kube/config`.
async fn create_client() -> Client {
    let client_config = match ClientConfig::incluster() {
        Ok(client_config) => client_config,
        Err(incluster_err) => {
            info!("Not running in a cluster ({incluster_err}), using kubeconfig");
            match load_kubeconfig().await {
                Ok(client_config) => client_config,
                Err(err) => {
                    error!("Couldn't load cluster credentials! {err}");
                    exit(2)
                }
            }
        }
    };

    match Client::try_from(client_config) {
        Ok(client) => client,
        Err(err) => {
            error!("Couldn't create client! {err}");
            exit(3)
        }
    }
}

async fn load_kubeconfig() -> Result<ClientConfig, kube_client::config::KubeconfigError> {
    let kubeconfig = Kubeconfig::read()?;
    ClientConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                error!("Couldn't listen for SIGTERM! {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
    info!("Received shutdown signal");
    shutdown.cancel();
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init()
}
