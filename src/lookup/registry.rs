//! Docker Registry v2 hashing service.
//!
//! Resolves a tag to its manifest digest with a single HEAD request; the
//! digest comes from the `Docker-Content-Digest` response header and is
//! never recomputed locally. Anonymous bearer tokens are fetched on demand
//! by following the `WWW-Authenticate` challenge and cached per scope.
//! Retry policy lives in the driver, not here: a saturated registry maps to
//! [HashResponse::Busy] and everything else resolves or fails in one shot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::debug;

use super::{HashResponse, HashingService};
use crate::reference::{ContentDigest, ImageRef};

const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";
const DIGEST_HEADER: &str = "docker-content-digest";
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;
const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

pub struct RegistryHashingService {
    client: Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(serde::Deserialize)]
struct TokenPayload {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl RegistryHashingService {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("tagpin/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn head_manifest(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        let mut request = self.client.head(url).header(header::ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request.send().await
    }

    async fn cached_token(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().await;
        tokens.get(scope).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    async fn cache_token(&self, scope: String, token: String, expires_in: Option<u64>) {
        let expires_in = expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS));
        let mut tokens = self.tokens.lock().await;
        tokens.insert(scope, CachedToken { token, expires_at });
        tokens.retain(|_, cached| cached.expires_at > Instant::now());
    }

    /// Follow a `WWW-Authenticate: Bearer realm=…` challenge and fetch an
    /// anonymous pull token.
    async fn bearer_token(&self, challenge: &str, repository: &str) -> Option<String> {
        let challenge = challenge.strip_prefix("Bearer ").unwrap_or(challenge);
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in challenge.split(',') {
            let part = part.trim();
            if let Some(value) = unquote(part, "realm=") {
                realm = Some(value);
            } else if let Some(value) = unquote(part, "service=") {
                service = Some(value);
            } else if let Some(value) = unquote(part, "scope=") {
                scope = Some(value);
            }
        }

        let realm = realm?;
        let scope = scope.unwrap_or_else(|| format!("repository:{repository}:pull"));
        if let Some(token) = self.cached_token(&scope).await {
            return Some(token);
        }

        let mut url = format!("{realm}?scope={scope}");
        if let Some(service) = service {
            url.push_str(&format!("&service={service}"));
        }
        debug!(scope = %scope, "fetching registry token");
        let payload: TokenPayload = self.client.get(&url).send().await.ok()?.json().await.ok()?;
        let token = payload.token.or(payload.access_token)?;
        self.cache_token(scope, token.clone(), payload.expires_in).await;
        Some(token)
    }
}

fn unquote(part: &str, key: &str) -> Option<String> {
    part.strip_prefix(key)
        .map(|value| value.trim_matches('"').to_owned())
}

fn registry_host(reference: &ImageRef) -> String {
    match reference.registry() {
        None | Some("docker.io") => DEFAULT_REGISTRY_HOST.to_owned(),
        Some(host) => host.to_owned(),
    }
}

/// Official Docker Hub images live under the implicit `library/` namespace.
fn scoped_repository(reference: &ImageRef) -> String {
    let repository = reference.repository();
    let on_hub = matches!(reference.registry(), None | Some("docker.io"));
    if on_hub && !repository.contains('/') {
        format!("library/{repository}")
    } else {
        repository.to_owned()
    }
}

fn scheme_for(host: &str) -> &'static str {
    // Bare-hostname registries (localhost, in-cluster names) speak http.
    if host.starts_with("localhost") || !host.contains('.') {
        "http"
    } else {
        "https"
    }
}

#[async_trait]
impl HashingService for RegistryHashingService {
    async fn request_hash(&self, reference: &ImageRef) -> HashResponse {
        if let Some(digest) = reference.digest() {
            return HashResponse::Found(digest.clone());
        }

        let host = registry_host(reference);
        let repository = scoped_repository(reference);
        let version = reference.tag().unwrap_or("latest");
        let url = format!(
            "{}://{host}/v2/{repository}/manifests/{version}",
            scheme_for(&host)
        );

        let scope = format!("repository:{repository}:pull");
        let token = self.cached_token(&scope).await;
        let mut response = match self.head_manifest(&url, token.as_deref()).await {
            Ok(response) => response,
            Err(err) => return HashResponse::Failed(format!("registry request failed: {err}")),
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let Some(challenge) = challenge else {
                return HashResponse::Failed(format!(
                    "registry denied access to {reference} without an auth challenge"
                ));
            };
            let Some(token) = self.bearer_token(&challenge, &repository).await else {
                return HashResponse::Failed(format!(
                    "failed to obtain a registry token for {reference}"
                ));
            };
            response = match self.head_manifest(&url, Some(&token)).await {
                Ok(response) => response,
                Err(err) => {
                    return HashResponse::Failed(format!("registry request failed: {err}"))
                }
            };
        }

        match response.status() {
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get(DIGEST_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(ContentDigest::parse);
                match digest {
                    Some(Ok(digest)) => HashResponse::Found(digest),
                    Some(Err(err)) => {
                        HashResponse::Failed(format!("registry returned a bad digest: {err}"))
                    }
                    None => HashResponse::Failed(format!(
                        "registry response for {reference} carried no digest header"
                    )),
                }
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => HashResponse::Busy,
            StatusCode::NOT_FOUND => {
                HashResponse::Failed(format!("manifest not found for {reference}"))
            }
            status => HashResponse::Failed(format!("registry returned {status} for {reference}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(raw: &str) -> ImageRef {
        raw.parse().expect("parse reference")
    }

    #[test]
    fn hub_images_gain_the_library_namespace() {
        assert_eq!(scoped_repository(&reference("ubuntu:18.04")), "library/ubuntu");
        assert_eq!(scoped_repository(&reference("acme/tool:v1")), "acme/tool");
        assert_eq!(
            scoped_repository(&reference("ghcr.io/acme/tool:v1")),
            "acme/tool"
        );
    }

    #[test]
    fn hub_aliases_map_to_the_v2_endpoint() {
        assert_eq!(registry_host(&reference("ubuntu:18.04")), DEFAULT_REGISTRY_HOST);
        assert_eq!(
            registry_host(&reference("docker.io/library/ubuntu:18.04")),
            DEFAULT_REGISTRY_HOST
        );
        assert_eq!(registry_host(&reference("quay.io/acme/tool:v1")), "quay.io");
    }

    #[test]
    fn local_registries_use_http() {
        assert_eq!(scheme_for("localhost:5000"), "http");
        assert_eq!(scheme_for("registry-1.docker.io"), "https");
    }
}
