//! Pure functions deriving the desired secret mount from workload labels and
//! merging it into a pod spec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{KeyToPath, PodSpec, Secret, SecretVolumeSource, Volume, VolumeMount};

use crate::config::{
    OPT_IN_LABEL, SECRET_KEYS_LABEL, SECRET_KEYS_SEPARATOR, SECRET_NAME_LABEL, VOLUME_NAME_SUFFIX,
};

/// What the labels of a workload ask for.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision<'a> {
    NotOptedIn,
    MissingSecretName,
    Mount {
        secret_name: &'a str,
        /// `None` mounts every key of the secret.
        keys: Option<Vec<&'a str>>,
    },
}

pub fn decide<'a>(labels: Option<&'a BTreeMap<String, String>>, identity: &str) -> Decision<'a> {
    let Some(labels) = labels else {
        return Decision::NotOptedIn;
    };
    if labels.get(OPT_IN_LABEL).map(String::as_str) != Some(identity) {
        return Decision::NotOptedIn;
    }
    let Some(secret_name) = labels.get(SECRET_NAME_LABEL) else {
        return Decision::MissingSecretName;
    };

    let keys = labels.get(SECRET_KEYS_LABEL).map(|keys| {
        let mut parsed: Vec<&str> = Vec::new();
        for key in keys.split(SECRET_KEYS_SEPARATOR) {
            if !key.is_empty() && !parsed.contains(&key) {
                parsed.push(key);
            }
        }
        parsed
    });

    Decision::Mount {
        secret_name: secret_name.as_str(),
        keys,
    }
}

/// Whether `key` exists in either the binary or the string data of `secret`.
pub fn has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|data| data.contains_key(key))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|data| data.contains_key(key))
}

/// Name of the volume a secret gets mounted through.
pub fn volume_name(secret_name: &str) -> String {
    format!("{secret_name}{VOLUME_NAME_SUFFIX}")
}

/// The secret volume for a workload, along with requested keys the secret lacks.
#[derive(Debug, PartialEq)]
pub struct Projection {
    pub volume: Volume,
    pub missing: Vec<String>,
}

pub fn project(secret_name: &str, keys: Option<&[&str]>, secret: &Secret) -> Projection {
    let mut missing = Vec::new();
    let items = keys.map(|keys| {
        keys.iter()
            .filter(|key| {
                let found = has_key(secret, key);
                if !found {
                    missing.push((**key).to_owned());
                }
                found
            })
            .map(|key| KeyToPath {
                key: (*key).to_owned(),
                path: (*key).to_owned(),
                ..Default::default()
            })
            .collect::<Vec<_>>()
    });

    Projection {
        volume: Volume {
            name: volume_name(secret_name),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_owned()),
                // an empty item list is the same as none: every key is mounted
                items: items.filter(|items| !items.is_empty()),
                ..Default::default()
            }),
            ..Default::default()
        },
        missing,
    }
}

pub fn volume_mount(volume_name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: volume_name.to_owned(),
        mount_path: mount_path.to_owned(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// A container already mounts some other volume where the secret should go.
#[derive(Debug, PartialEq, Eq)]
pub struct PathInUse {
    pub container: String,
    pub volume: String,
}

fn path_in_use(spec: &PodSpec, mount: &VolumeMount) -> Option<PathInUse> {
    spec.containers.iter().find_map(|container| {
        container
            .volume_mounts
            .iter()
            .flatten()
            .find(|current| current.mount_path == mount.mount_path && current.name != mount.name)
            .map(|current| PathInUse {
                container: container.name.clone(),
                volume: current.name.clone(),
            })
    })
}

/// Makes `spec` carry exactly one copy of `volume` and of `mount` in every
/// container. Returns whether anything had to change.
///
/// Fields defaulted by the apiserver (such as `defaultMode`) are not compared,
/// so an already mounted workload reads back as unchanged. Mounts of other
/// volumes are never touched; if one sits at the mount path, `spec` is left
/// as it is and the occupant is returned.
pub fn ensure_mounted(
    spec: &mut PodSpec,
    volume: Volume,
    mount: VolumeMount,
) -> Result<bool, PathInUse> {
    if let Some(occupied) = path_in_use(spec, &mount) {
        return Err(occupied);
    }

    let mut changed = upsert(
        spec.volumes.get_or_insert_with(Vec::new),
        volume,
        |current, desired| current.name == desired.name,
        same_secret_volume,
    );

    for container in &mut spec.containers {
        changed |= upsert(
            container.volume_mounts.get_or_insert_with(Vec::new),
            mount.clone(),
            |current, desired| current.name == desired.name,
            |current, desired| {
                current.name == desired.name
                    && current.mount_path == desired.mount_path
                    && current.read_only == desired.read_only
                    && current.sub_path.is_none()
            },
        );
    }

    Ok(changed)
}

fn same_secret_volume(current: &Volume, desired: &Volume) -> bool {
    let source = |volume: &Volume| {
        volume
            .secret
            .as_ref()
            .map(|secret| (secret.secret_name.clone(), secret.items.clone()))
    };
    current.name == desired.name
        && current.config_map.is_none()
        && current.empty_dir.is_none()
        && current.host_path.is_none()
        && current.persistent_volume_claim.is_none()
        && current.projected.is_none()
        && source(current) == source(desired)
}

/// Replaces the first item occupying `desired`'s slot and drops any further
/// ones, or appends `desired` if the slot is free.
fn upsert<T>(
    items: &mut Vec<T>,
    desired: T,
    same_slot: impl Fn(&T, &T) -> bool,
    equivalent: impl Fn(&T, &T) -> bool,
) -> bool {
    let Some(first) = items.iter().position(|item| same_slot(item, &desired)) else {
        items.push(desired);
        return true;
    };

    let before = items.len();
    let mut index = 0;
    items.retain(|item| {
        let keep = index == first || !same_slot(item, &desired);
        index += 1;
        keep
    });
    let mut changed = items.len() != before;

    if let Some(slot) = items.get_mut(first) {
        if !equivalent(slot, &desired) {
            *slot = desired;
            changed = true;
        }
    }
    changed
}
