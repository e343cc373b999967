//! `caprun-installer` — fetch, verify, and record subprocess packages.
//!
//! A dependency's install command names an npm package
//! (`npx @mcp/memory@1.0.0`). Installation resolves the package against
//! the npm registry, downloads the tarball, verifies it against the
//! declared integrity token, and records the result in the dependency
//! state. Re-installing an already-present matching version is a no-op.
//!
//! Integrity failures and install failures are distinct: a hash
//! mismatch is never reported as a download problem.

mod package_spec;

pub use package_spec::{parse_package_spec, PackageSpec};

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use caprun_domain::capability::SubprocessDep;
use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::events::RuntimeEvent;
use caprun_state::{short_hash, DependencyState, IntegrityToken};

/// Default upstream package registry.
pub const DEFAULT_NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Result of an install operation.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub name: String,
    pub version: String,
    /// The verified integrity token now recorded in the state.
    pub integrity: String,
    /// True when the exact version was already installed and nothing
    /// was fetched.
    pub already_installed: bool,
    pub install_path: Option<PathBuf>,
}

/// Package installer backed by the npm registry.
pub struct Installer {
    registry_base: String,
    http: reqwest::Client,
    state: Arc<DependencyState>,
}

/// Subset of the npm version document the installer needs.
#[derive(Debug, Deserialize)]
struct NpmVersionDoc {
    dist: NpmDist,
}

#[derive(Debug, Deserialize)]
struct NpmDist {
    tarball: String,
}

impl Installer {
    pub fn new(state: Arc<DependencyState>) -> Self {
        Self::with_registry(state, DEFAULT_NPM_REGISTRY)
    }

    pub fn with_registry(state: Arc<DependencyState>, registry_base: &str) -> Self {
        Self {
            registry_base: registry_base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            state,
        }
    }

    /// Install a dependency: resolve, download, verify, record.
    pub async fn install(&self, dep: &SubprocessDep) -> Result<InstallOutcome> {
        if self.state.is_installed(&dep.name, &dep.version) {
            tracing::debug!(dep = %dep.name, version = %dep.version, "already installed, skipping");
            let record = self.state.get(&dep.name);
            return Ok(InstallOutcome {
                name: dep.name.clone(),
                version: dep.version.clone(),
                integrity: record
                    .map(|r| r.integrity)
                    .unwrap_or_else(|| dep.integrity.clone()),
                already_installed: true,
                install_path: None,
            });
        }

        let declared = IntegrityToken::parse(&dep.integrity)?;
        let spec = parse_package_spec(&dep.install, &dep.version)?;

        tracing::info!(
            dep = %dep.name,
            package = %spec.name,
            version = %spec.version,
            "installing dependency package"
        );

        let tarball_url = self.resolve_tarball(&spec, &dep.name).await?;
        let bytes = self.download(&tarball_url, &dep.name).await?;

        if !declared.matches(&bytes) {
            return Err(Error::new(
                ErrorKind::DependencyIntegrityFailed,
                format!(
                    "package {} does not match declared integrity {}",
                    spec.name,
                    short_hash(&dep.integrity)
                ),
            )
            .with("dependency", dep.name.as_str())
            .with("package", spec.name.as_str())
            .with("expected", short_hash(&dep.integrity)));
        }

        self.state.mark_installed(dep, &dep.integrity, None)?;
        RuntimeEvent::DependencyInstalled {
            name: dep.name.clone(),
            version: dep.version.clone(),
            already_installed: false,
        }
        .emit();

        Ok(InstallOutcome {
            name: dep.name.clone(),
            version: dep.version.clone(),
            integrity: dep.integrity.clone(),
            already_installed: false,
            install_path: None,
        })
    }

    /// Resolve the tarball URL from the registry's version document.
    async fn resolve_tarball(&self, spec: &PackageSpec, dep_name: &str) -> Result<String> {
        // npm registry convention for scoped packages: the scope slash
        // is encoded, the leading `@` stays literal.
        let url = format!(
            "{}/{}/{}",
            self.registry_base,
            spec.name.replace('/', "%2F"),
            spec.version
        );

        let response = self.http.get(&url).send().await.map_err(|error| {
            install_failed(dep_name, format!("package registry unreachable: {error}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(install_failed(
                dep_name,
                format!("package registry answered HTTP {status} for {}@{}", spec.name, spec.version),
            )
            .with("package", spec.name.as_str()));
        }

        let doc: NpmVersionDoc = response.json().await.map_err(|error| {
            install_failed(dep_name, format!("unparseable package registry document: {error}"))
        })?;
        Ok(doc.dist.tarball)
    }

    async fn download(&self, url: &str, dep_name: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| install_failed(dep_name, format!("tarball download failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(install_failed(
                dep_name,
                format!("tarball download answered HTTP {status}"),
            ));
        }

        let bytes = response.bytes().await.map_err(|error| {
            install_failed(dep_name, format!("tarball download interrupted: {error}"))
        })?;
        Ok(bytes.to_vec())
    }
}

fn install_failed(dep_name: &str, message: String) -> Error {
    Error::new(ErrorKind::DependencyInstallFailed, message).with("dependency", dep_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caprun_domain::capability::DepTransport;
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TARBALL: &[u8] = b"fake tarball bytes";

    fn dep(integrity: &str) -> SubprocessDep {
        SubprocessDep {
            name: "memory".into(),
            transport: DepTransport::Stdio,
            install: "npx @mcp/memory@1.0.0".into(),
            version: "1.0.0".into(),
            integrity: integrity.into(),
            env_required: vec![],
            command: None,
            args: None,
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    async fn mock_registry(server: &MockServer, expect_hits: u64) {
        let tarball_url = format!("{}/tarballs/memory-1.0.0.tgz", server.uri());
        Mock::given(method("GET"))
            .and(path("/@mcp%2Fmemory/1.0.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"dist": {"tarball": tarball_url}})),
            )
            .expect(expect_hits)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tarballs/memory-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(TARBALL))
            .expect(expect_hits)
            .mount(server)
            .await;
    }

    fn make_state() -> (tempfile::TempDir, Arc<DependencyState>) {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(DependencyState::load(&tmp.path().join("deps.json")));
        (tmp, state)
    }

    #[tokio::test]
    async fn install_verifies_and_records() {
        let server = MockServer::start().await;
        mock_registry(&server, 1).await;

        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state.clone(), &server.uri());
        let good = dep(&format!("sha256-{}", sha256_hex(TARBALL)));

        let outcome = installer.install(&good).await.unwrap();
        assert!(!outcome.already_installed);
        assert!(state.is_installed("memory", "1.0.0"));
        assert_eq!(state.get("memory").unwrap().integrity, good.integrity);
    }

    #[tokio::test]
    async fn reinstall_is_idempotent_no_op() {
        let server = MockServer::start().await;
        mock_registry(&server, 1).await;

        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state.clone(), &server.uri());
        let good = dep(&format!("sha256-{}", sha256_hex(TARBALL)));

        installer.install(&good).await.unwrap();
        // Second install must not touch the network (expect(1) above).
        let outcome = installer.install(&good).await.unwrap();
        assert!(outcome.already_installed);
    }

    #[tokio::test]
    async fn hash_mismatch_is_integrity_failure() {
        let server = MockServer::start().await;
        mock_registry(&server, 1).await;

        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state.clone(), &server.uri());
        let bad = dep(&format!("sha256-{}", sha256_hex(b"something else")));

        let err = installer.install(&bad).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyIntegrityFailed);
        assert!(!state.is_installed("memory", "1.0.0"));
    }

    #[tokio::test]
    async fn legacy_sha1_token_verifies() {
        let server = MockServer::start().await;
        mock_registry(&server, 1).await;

        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state.clone(), &server.uri());
        let sha1_hex = hex::encode(<sha1::Sha1 as sha1::Digest>::digest(TARBALL));
        let legacy = dep(&format!("sha1-{sha1_hex}"));

        let outcome = installer.install(&legacy).await.unwrap();
        assert!(!outcome.already_installed);
    }

    #[tokio::test]
    async fn registry_miss_is_install_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/@mcp%2Fmemory/1.0.0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state, &server.uri());
        let err = installer
            .install(&dep(&format!("sha256-{}", sha256_hex(TARBALL))))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyInstallFailed);
    }

    #[tokio::test]
    async fn malformed_integrity_token_fails_before_any_fetch() {
        let server = MockServer::start().await;
        // No mocks mounted: any request would 404 and fail differently.
        let (_tmp, state) = make_state();
        let installer = Installer::with_registry(state, &server.uri());
        let err = installer.install(&dep("md5-nope")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyIntegrityFailed);
    }
}
