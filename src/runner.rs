use std::sync::Arc;

use futures::{future::join_all, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube_client::{Api, Client};
use kube_runtime::{reflector::store::Writer, watcher};
use log::{error, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    queue::{default_controller_rate_limiter, WorkQueue},
    reconciler::{ClusterApi, KubeApi, Reconciler, WorkloadCache},
    subscriber::{self, ObjectKey, QueueingHandler, SyncSignal},
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Worker task failed: {}", .0)]
    Worker(tokio::task::JoinError),
}

/// Pulls keys off `queue` and reconciles them until the queue shuts down.
///
/// Failed keys are re-added with backoff, successful ones have their backoff
/// reset. Every key is marked done regardless of the outcome.
pub async fn worker<C, A>(queue: WorkQueue<ObjectKey>, reconciler: Arc<Reconciler<C, A>>)
where
    C: WorkloadCache,
    A: ClusterApi,
{
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                info!("Reconciled {key}: {outcome}");
                queue.forget(&key);
            }
            Err(err) if err.is_conflict() => {
                info!("Workload {key} changed while reconciling, retrying");
                queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                warn!(
                    "Reconciling {key} failed (retry {}): {err}",
                    queue.num_requeues(&key) + 1
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
}

/// Runs `workers` worker loops and waits until all of them have exited.
pub async fn run_workers<C, A>(
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler<C, A>>,
    workers: usize,
) -> Result<(), RunError>
where
    C: WorkloadCache + 'static,
    A: ClusterApi + 'static,
{
    let handles: Vec<_> = (0..workers)
        .map(|_| tokio::spawn(worker(queue.clone(), Arc::clone(&reconciler))))
        .collect();

    for result in join_all(handles).await {
        result.map_err(RunError::Worker)?;
    }
    Ok(())
}

/// Watches deployments and mounts opted-in secrets until `shutdown` is cancelled.
pub async fn run(client: Client, config: Config, shutdown: CancellationToken) -> Result<(), RunError> {
    info!("Starting {} controller...", config.identity);

    let api: Api<Deployment> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let writer = Writer::<Deployment>::default();
    let store = writer.as_reader();
    let synced = SyncSignal::default();
    let queue = WorkQueue::new(default_controller_rate_limiter());

    let events = subscriber::objects(
        api,
        watcher::Config::default(),
        writer,
        QueueingHandler::new(queue.clone()),
        synced.clone(),
    );
    let watch = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut events = std::pin::pin!(events);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => error!("Deployment watch failed: {err}"),
                        None => break,
                    },
                }
            }
        }
    });

    info!("Waiting for the deployment cache to sync...");
    tokio::select! {
        () = synced.wait() => info!("Deployment cache synced"),
        () = shutdown.cancelled() => {}
    }

    let reconciler = Arc::new(Reconciler::new(store, KubeApi::new(client), config.clone()));
    let workers = tokio::spawn(run_workers(queue.clone(), reconciler, config.workers));

    shutdown.cancelled().await;
    info!("Shutting down...");
    queue.shut_down();

    let result = match workers.await {
        Ok(result) => result,
        Err(err) => Err(RunError::Worker(err)),
    };
    if let Err(err) = watch.await {
        warn!("Deployment watch task failed: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        queue::rate_limiter::ExponentialFailureRateLimiter,
        tests::{deployment, secret, FakeApi, FakeCache},
    };

    fn queue() -> WorkQueue<ObjectKey> {
        WorkQueue::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keys_are_retried_until_they_succeed() {
        let labels = [("app", "secret-deployer"), ("secret-name", "creds")];
        let web = deployment("ns1", "web", &labels);
        let cache = FakeCache::with(&[web.clone()]);
        let api = FakeApi::default();
        api.insert_workload(web);
        let reconciler = Arc::new(Reconciler::new(cache, api.clone(), Config::default()));

        let queue = queue();
        let key = ObjectKey::new("ns1", "web");
        queue.add(key.clone());
        let workers = tokio::spawn(run_workers(queue.clone(), reconciler, 2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.writes(), 0);
        assert!(queue.num_requeues(&key) > 0);

        api.insert_secret(secret("ns1", "creds", &["user"]));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(api.writes(), 1);
        assert_eq!(queue.num_requeues(&key), 0);

        queue.shut_down();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn workers_exit_on_shutdown() {
        let reconciler = Arc::new(Reconciler::new(
            FakeCache::default(),
            FakeApi::default(),
            Config::default(),
        ));
        let queue = queue();
        let workers = tokio::spawn(run_workers(queue.clone(), reconciler, 3));

        tokio::task::yield_now().await;
        queue.shut_down();
        workers.await.unwrap().unwrap();
    }
}
