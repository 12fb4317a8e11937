use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("Secret '{namespace}/{name}' doesn't exist!")]
    SecretNotFound { namespace: String, name: String },
    #[error("The workload was modified concurrently: {}", .0)]
    Conflict(kube_client::Error),
    #[error("Cluster API request failed: {}", .0)]
    Api(kube_client::Error),
}

impl Error {
    /// Sorts API failures into write conflicts and everything else.
    pub fn from_api(error: kube_client::Error) -> Self {
        match &error {
            kube_client::Error::Api(response) if response.code == 409 => Self::Conflict(error),
            _ => Self::Api(error),
        }
    }

    /// Conflicts are expected whenever another writer got to the object first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
