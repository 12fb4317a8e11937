//! Reconciles a single workload key against the cluster.

use std::{fmt, future::Future, sync::Arc};

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
use kube_client::{api::PostParams, Api, Client};
use kube_runtime::reflector::{ObjectRef, Store};
use log::{info, warn};

use crate::{config::Config, subscriber::ObjectKey};

pub mod error;
pub mod mount;

pub use error::Error;
use mount::{Decision, PathInUse};

/// Read access to the locally cached workloads.
pub trait WorkloadCache: Send + Sync {
    fn workload(&self, key: &ObjectKey) -> Option<Arc<Deployment>>;
}

impl WorkloadCache for Store<Deployment> {
    fn workload(&self, key: &ObjectKey) -> Option<Arc<Deployment>> {
        let mut obj_ref = ObjectRef::new(&key.name);
        if let Some(namespace) = &key.namespace {
            obj_ref = obj_ref.within(namespace);
        }
        self.get(&obj_ref)
    }
}

/// Live cluster calls needed to mount a secret.
pub trait ClusterApi: Send + Sync {
    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Secret>, kube_client::Error>> + Send;

    fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>, kube_client::Error>> + Send;

    /// Replaces the whole object; rejected with 409 if its `resourceVersion` is stale.
    fn replace_workload(
        &self,
        namespace: &str,
        name: &str,
        workload: &Deployment,
    ) -> impl Future<Output = Result<Deployment, kube_client::Error>> + Send;
}

/// [`ClusterApi`] backed by a real apiserver connection.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterApi for KubeApi {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, kube_client::Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube_client::Error> {
        Api::<Deployment>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn replace_workload(
        &self,
        namespace: &str,
        name: &str,
        workload: &Deployment,
    ) -> Result<Deployment, kube_client::Error> {
        Api::<Deployment>::namespaced(self.client.clone(), namespace)
            .replace(name, &PostParams::default(), workload)
            .await
    }
}

/// Why a workload was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotOptedIn,
    MissingSecretName,
    NoPodTemplate,
    /// Another volume is already mounted at the mount path.
    MountPathInUse,
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The workload no longer exists.
    Gone,
    Skipped(SkipReason),
    /// The secret was already mounted as desired; nothing was written.
    UpToDate,
    Updated,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Gone => f.write_str("workload is gone"),
            Outcome::Skipped(SkipReason::NotOptedIn) => f.write_str("not opted in"),
            Outcome::Skipped(SkipReason::MissingSecretName) => f.write_str("no secret name label"),
            Outcome::Skipped(SkipReason::NoPodTemplate) => f.write_str("no pod template"),
            Outcome::Skipped(SkipReason::MountPathInUse) => f.write_str("mount path in use"),
            Outcome::UpToDate => f.write_str("already up to date"),
            Outcome::Updated => f.write_str("secret mounted"),
        }
    }
}

pub struct Reconciler<C, A> {
    cache: C,
    api: A,
    config: Config,
}

impl<C: WorkloadCache, A: ClusterApi> Reconciler<C, A> {
    pub fn new(cache: C, api: A, config: Config) -> Self {
        Self { cache, api, config }
    }

    /// Mounts the secret referenced by the workload's labels, writing only when
    /// the live object differs from the desired state.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        let Some(cached) = self.cache.workload(key) else {
            return Ok(Outcome::Gone);
        };
        let namespace = key
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectMetadata)?;

        let (secret_name, keys) =
            match mount::decide(cached.metadata.labels.as_ref(), &self.config.identity) {
                Decision::NotOptedIn => return Ok(Outcome::Skipped(SkipReason::NotOptedIn)),
                Decision::MissingSecretName => {
                    info!("Secret name not found in the labels of {key}, skipping secret mount");
                    return Ok(Outcome::Skipped(SkipReason::MissingSecretName));
                }
                Decision::Mount { secret_name, keys } => (secret_name, keys),
            };

        let secret = self
            .api
            .get_secret(namespace, secret_name)
            .await
            .map_err(Error::from_api)?
            .ok_or_else(|| Error::SecretNotFound {
                namespace: namespace.to_owned(),
                name: secret_name.to_owned(),
            })?;

        // the cached copy may be stale, mutate the latest version instead
        let Some(mut workload) = self
            .api
            .get_workload(namespace, &key.name)
            .await
            .map_err(Error::from_api)?
        else {
            return Ok(Outcome::Gone);
        };

        let projection = mount::project(secret_name, keys.as_deref(), &secret);
        for missing in &projection.missing {
            warn!("Key {missing} not found in secret {secret_name}, skipping mount for key {missing}");
        }
        let volume = projection.volume;

        let Some(pod_spec) = workload
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
        else {
            warn!("Workload {key} has no pod template, skipping secret mount");
            return Ok(Outcome::Skipped(SkipReason::NoPodTemplate));
        };

        let volume_mount = mount::volume_mount(&volume.name, &self.config.mount_path);
        match mount::ensure_mounted(pod_spec, volume, volume_mount) {
            Ok(true) => {}
            Ok(false) => return Ok(Outcome::UpToDate),
            Err(PathInUse { container, volume }) => {
                warn!(
                    "Container {container} of {key} already mounts volume {volume} at {}, skipping secret mount",
                    self.config.mount_path
                );
                return Ok(Outcome::Skipped(SkipReason::MountPathInUse));
            }
        }

        self.api
            .replace_workload(namespace, &key.name, &workload)
            .await
            .map_err(Error::from_api)?;
        info!("Workload {key} has been updated with the desired keys of secret {secret_name}");

        Ok(Outcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{deployment, item_keys, mounts, secret, volumes, FakeApi, FakeCache};

    const OPTED_IN: [(&str, &str); 2] = [("app", "secret-deployer"), ("secret-name", "creds")];

    fn setup(labels: &[(&str, &str)], secret_keys: Option<&[&str]>) -> (Reconciler<FakeCache, FakeApi>, FakeApi) {
        let web = deployment("ns1", "web", labels);
        let api = FakeApi::default();
        api.insert_workload(web.clone());
        if let Some(keys) = secret_keys {
            api.insert_secret(secret("ns1", "creds", keys));
        }
        let reconciler = Reconciler::new(FakeCache::with(&[web]), api.clone(), Config::default());
        (reconciler, api)
    }

    fn web() -> ObjectKey {
        ObjectKey::new("ns1", "web")
    }

    #[tokio::test]
    async fn not_opted_in_is_never_written() {
        for labels in [
            &[][..],
            &[("app", "web"), ("secret-name", "creds")][..],
            &[("secret-name", "creds")][..],
        ] {
            let (reconciler, api) = setup(labels, Some(&["user"]));
            assert_eq!(
                reconciler.reconcile(&web()).await.unwrap(),
                Outcome::Skipped(SkipReason::NotOptedIn)
            );
            assert_eq!(api.writes(), 0);
        }
    }

    #[tokio::test]
    async fn missing_secret_name_is_skipped() {
        let (reconciler, api) = setup(&[("app", "secret-deployer")], Some(&["user"]));
        assert_eq!(
            reconciler.reconcile(&web()).await.unwrap(),
            Outcome::Skipped(SkipReason::MissingSecretName)
        );
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn unfiltered_mount_exposes_all_keys() {
        let (reconciler, api) = setup(&OPTED_IN, Some(&["user", "pass"]));
        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Updated);

        let volumes = volumes(&api.workload("ns1", "web"));
        assert_eq!(volumes.len(), 1);
        assert_eq!(item_keys(&volumes[0]), None);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("creds")
        );
    }

    #[tokio::test]
    async fn key_filter_skips_missing_keys_in_order() {
        let labels = [
            ("app", "secret-deployer"),
            ("secret-name", "creds"),
            ("secret-keys", "a.b.c"),
        ];
        let (reconciler, api) = setup(&labels, Some(&["c", "a"]));
        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Updated);

        let volumes = volumes(&api.workload("ns1", "web"));
        assert_eq!(
            item_keys(&volumes[0]),
            Some(vec!["a".to_owned(), "c".to_owned()])
        );
    }

    #[tokio::test]
    async fn key_filter_without_matches_mounts_every_key() {
        for filter in ["missing", ""] {
            let labels = [
                ("app", "secret-deployer"),
                ("secret-name", "creds"),
                ("secret-keys", filter),
            ];
            let (reconciler, api) = setup(&labels, Some(&["user", "pass"]));
            assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Updated);

            let volumes = volumes(&api.workload("ns1", "web"));
            assert_eq!(volumes.len(), 1);
            assert_eq!(item_keys(&volumes[0]), None);
        }
    }

    #[tokio::test]
    async fn occupied_mount_path_is_skipped() {
        let mut workload = deployment("ns1", "web", &OPTED_IN);
        let template = workload.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        template.containers[0].volume_mounts = Some(vec![mount::volume_mount(
            "cfg",
            "/etc/secret-deployer-data/",
        )]);
        let api = FakeApi::default();
        api.insert_workload(workload.clone());
        api.insert_secret(secret("ns1", "creds", &["user"]));
        let reconciler =
            Reconciler::new(FakeCache::with(&[workload]), api.clone(), Config::default());

        assert_eq!(
            reconciler.reconcile(&web()).await.unwrap(),
            Outcome::Skipped(SkipReason::MountPathInUse)
        );
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let (reconciler, api) = setup(&OPTED_IN, Some(&["user"]));
        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Updated);
        let first = api.workload("ns1", "web");

        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::UpToDate);
        assert_eq!(api.writes(), 1);
        assert_eq!(api.workload("ns1", "web"), first);
    }

    #[tokio::test]
    async fn missing_secret_fails_without_mutation() {
        let (reconciler, api) = setup(&OPTED_IN, None);
        let before = api.workload("ns1", "web");

        let err = reconciler.reconcile(&web()).await.unwrap_err();
        assert!(matches!(err, Error::SecretNotFound { ref name, .. } if name == "creds"));
        assert_eq!(api.writes(), 0);
        assert_eq!(api.workload("ns1", "web"), before);
    }

    #[tokio::test]
    async fn conflicts_are_reported_and_resolved_by_retrying() {
        let (reconciler, api) = setup(&OPTED_IN, Some(&["user"]));
        api.fail_next_writes(&[409, 409, 409]);

        for _ in 0..3 {
            let err = reconciler.reconcile(&web()).await.unwrap_err();
            assert!(err.is_conflict());
        }
        assert!(volumes(&api.workload("ns1", "web")).is_empty());

        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Updated);
        let web = api.workload("ns1", "web");
        assert_eq!(volumes(&web).len(), 1);
        assert!(mounts(&web).iter().all(|mounts| mounts.len() == 1));
    }

    #[tokio::test]
    async fn other_api_failures_are_not_conflicts() {
        let (reconciler, api) = setup(&OPTED_IN, Some(&["user"]));
        api.fail_next_writes(&[500]);

        let err = reconciler.reconcile(&web()).await.unwrap_err();
        assert!(matches!(err, Error::Api(_)));
        assert!(!err.is_conflict());
    }

    #[tokio::test]
    async fn uncached_workload_is_gone() {
        let reconciler = Reconciler::new(FakeCache::default(), FakeApi::default(), Config::default());
        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Gone);
    }

    #[tokio::test]
    async fn workload_deleted_after_caching_is_gone() {
        let api = FakeApi::default();
        api.insert_secret(secret("ns1", "creds", &["user"]));
        let cache = FakeCache::with(&[deployment("ns1", "web", &OPTED_IN)]);
        let reconciler = Reconciler::new(cache, api.clone(), Config::default());

        assert_eq!(reconciler.reconcile(&web()).await.unwrap(), Outcome::Gone);
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn labels_are_preserved_on_update() {
        let labels = [
            ("app", "secret-deployer"),
            ("secret-name", "creds"),
            ("team", "payments"),
        ];
        let (reconciler, api) = setup(&labels, Some(&["user"]));
        reconciler.reconcile(&web()).await.unwrap();

        let web = api.workload("ns1", "web");
        let labels = web.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("payments"));
    }
}
