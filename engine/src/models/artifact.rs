//! Artifact references
//!
//! An artifact is produced by an external build service. The engine only
//! validates the reference and hands it to hooks through the environment;
//! fetching and verifying the bytes is the hooks' job.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::PipelineError;

/// Pointer to a previously built, versioned package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Where the package can be retrieved from
    pub location: String,

    /// Package version
    pub version: String,

    /// Checksum in `<algo>:<hex>` form
    pub checksum: String,
}

impl ArtifactReference {
    pub fn new(
        location: impl Into<String>,
        version: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            version: version.into(),
            checksum: checksum.into(),
        }
    }
}

/// A reference that passed resolution
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub reference: ArtifactReference,
    /// Normalized location handed to hooks
    pub location: String,
}

impl ResolvedArtifact {
    /// Use a reference as recorded, without resolving it again
    pub fn unchecked(reference: ArtifactReference) -> Self {
        Self {
            location: reference.location.clone(),
            reference,
        }
    }

    /// Environment variables injected into every hook
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "FLEETPIPE_ARTIFACT_LOCATION".to_string(),
                self.location.clone(),
            ),
            (
                "FLEETPIPE_ARTIFACT_VERSION".to_string(),
                self.reference.version.clone(),
            ),
            (
                "FLEETPIPE_ARTIFACT_CHECKSUM".to_string(),
                self.reference.checksum.clone(),
            ),
        ])
    }
}

/// Artifact store collaborator
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, reference: &ArtifactReference) -> Result<ResolvedArtifact, PipelineError>;
}

/// Resolver that checks the reference is well formed without contacting the store
#[derive(Debug, Clone)]
pub struct UrlArtifactResolver {
    allowed_schemes: Vec<String>,
}

impl UrlArtifactResolver {
    pub fn new(allowed_schemes: Vec<String>) -> Self {
        Self { allowed_schemes }
    }

    fn check_checksum(checksum: &str) -> Result<(), PipelineError> {
        let (algo, digest) = checksum.split_once(':').ok_or_else(|| {
            PipelineError::ValidationError(format!(
                "Checksum must look like <algo>:<hex>, got '{}'",
                checksum
            ))
        })?;

        let expected_len = match algo {
            "sha256" => 64,
            "sha512" => 128,
            other => {
                return Err(PipelineError::ValidationError(format!(
                    "Unsupported checksum algorithm: {}",
                    other
                )))
            }
        };

        if digest.len() != expected_len || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::ValidationError(format!(
                "Malformed {} digest",
                algo
            )));
        }

        Ok(())
    }
}

impl Default for UrlArtifactResolver {
    fn default() -> Self {
        Self::new(
            ["https", "http", "s3", "file", "oci"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

#[async_trait]
impl ArtifactResolver for UrlArtifactResolver {
    async fn resolve(&self, reference: &ArtifactReference) -> Result<ResolvedArtifact, PipelineError> {
        let location = Url::parse(&reference.location).map_err(|e| {
            PipelineError::ValidationError(format!(
                "Artifact location '{}' is not a valid URL: {}",
                reference.location, e
            ))
        })?;

        if !self.allowed_schemes.iter().any(|s| s == location.scheme()) {
            return Err(PipelineError::ValidationError(format!(
                "Artifact scheme '{}' is not supported",
                location.scheme()
            )));
        }

        if reference.version.trim().is_empty() {
            return Err(PipelineError::ValidationError(
                "Artifact version is empty".to_string(),
            ));
        }

        Self::check_checksum(&reference.checksum)?;

        Ok(ResolvedArtifact {
            reference: reference.clone(),
            location: location.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[tokio::test]
    async fn test_resolve_valid_reference() {
        let resolver = UrlArtifactResolver::default();
        let reference = ArtifactReference::new("s3://releases/app-1.2.0.tar.gz", "1.2.0", DIGEST);

        let resolved = resolver.resolve(&reference).await.unwrap();
        let env = resolved.env_vars();
        assert_eq!(env["FLEETPIPE_ARTIFACT_VERSION"], "1.2.0");
        assert_eq!(env["FLEETPIPE_ARTIFACT_LOCATION"], "s3://releases/app-1.2.0.tar.gz");
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_scheme() {
        let resolver = UrlArtifactResolver::default();
        let reference = ArtifactReference::new("gopher://old/app", "1.0", DIGEST);
        assert!(matches!(
            resolver.resolve(&reference).await,
            Err(PipelineError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_checksum() {
        let resolver = UrlArtifactResolver::default();
        for checksum in ["deadbeef", "md5:abc", "sha256:xyz"] {
            let reference = ArtifactReference::new("https://cdn/app.tgz", "1.0", checksum);
            assert!(resolver.resolve(&reference).await.is_err(), "{}", checksum);
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty_version() {
        let resolver = UrlArtifactResolver::default();
        let reference = ArtifactReference::new("https://cdn/app.tgz", "  ", DIGEST);
        assert!(resolver.resolve(&reference).await.is_err());
    }
}
