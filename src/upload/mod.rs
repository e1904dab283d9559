//! Hands a finished artifact to the review service.

use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

use crate::config::UploadConfig;
use crate::recording::Artifact;

const UPLOAD_TIMEOUT_SECS: u64 = 300;
const URL_LIMIT: usize = 2048;
const REPLY_LIMIT: usize = 1 << 20;
const REDIRECT_LIMIT: usize = 3;
const BLOCKED_HOSTS: &[&str] = &["localhost", "metadata.google.internal", "metadata", "instance-data"];
const BLOCKED_PORTS: &[u16] = &[0, 22, 23, 25, 110, 143, 445, 3306, 3389, 5432, 6379, 27017];
const MAX_REVIEW_ID_LEN: usize = 128;

const ALLOWED_MIME_TYPES: &[&str] = &[
    "video/webm",
    "video/mp4",
    "video/quicktime",
    "video/x-matroska",
    "image/gif",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub url: String,
}

pub struct ArtifactUploader {
    client: reqwest::blocking::Client,
    config: UploadConfig,
}

impl ArtifactUploader {
    pub fn new(config: UploadConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .user_agent(concat!("reviewcap/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(REDIRECT_LIMIT))
            .build()?;
        Ok(Self { client, config })
    }

    /// Checks everything that can be checked without touching the network.
    pub fn preflight(&self, artifact: &Artifact, review_id: &str) -> Result<()> {
        if !self.config.is_enabled() {
            return Err(anyhow!("Upload endpoint not configured"));
        }
        validate_endpoint(&self.config.endpoint)?;
        validate_review_id(review_id)?;
        validate_mime_type(&artifact.mime_type)?;
        if artifact.blob.is_empty() {
            return Err(anyhow!("Recording is empty"));
        }
        if artifact.size() as u64 > self.config.max_size_bytes() {
            return Err(anyhow!(
                "Recording too large to upload ({} bytes, limit {} MB)",
                artifact.size(),
                self.config.max_size_mb
            ));
        }
        Ok(())
    }

    /// Posts the artifact as a multipart form and returns the URL the
    /// service reports. Blocking; call it off the async runtime.
    pub fn upload(&self, artifact: &Artifact, review_id: &str) -> Result<UploadResult> {
        self.preflight(artifact, review_id)?;
        check_resolved_addresses(&self.config.endpoint)?;

        let mime = base_mime(&artifact.mime_type);
        let mut form = reqwest::blocking::multipart::Form::new()
            .text(self.config.review_id_field.clone(), review_id.to_string())
            .part(
                self.config.video_field.clone(),
                reqwest::blocking::multipart::Part::bytes(artifact.blob.clone())
                    .file_name(format!("{}.{}", artifact.session_id, artifact.extension()))
                    .mime_str(mime)?,
            );
        if let Some(thumbnail) = &artifact.thumbnail {
            form = form.part(
                self.config.thumbnail_field.clone(),
                reqwest::blocking::multipart::Part::bytes(thumbnail.clone())
                    .file_name(format!("{}.jpg", artifact.session_id))
                    .mime_str("image/jpeg")?,
            );
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()?;

        let body = read_reply(response)?;
        let url = extract_url_from_response(&body, &self.config.response_path)?;
        validate_returned_url(&url)?;
        info!(session = %artifact.session_id, review = review_id, url = %url, "recording uploaded");
        Ok(UploadResult { url })
    }
}

fn read_reply(response: reqwest::blocking::Response) -> Result<String> {
    if !response.status().is_success() {
        return Err(anyhow!("Review service rejected the upload ({})", response.status()));
    }
    let declared = response.content_length().unwrap_or(u64::MAX);
    if declared > REPLY_LIMIT as u64 {
        return Err(anyhow!("Review service reply exceeds {} bytes", REPLY_LIMIT));
    }
    let body = response.text()?;
    if body.len() > REPLY_LIMIT {
        return Err(anyhow!("Review service reply exceeds {} bytes", REPLY_LIMIT));
    }
    Ok(body)
}

fn base_mime(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or_default().trim()
}

fn validate_mime_type(mime_type: &str) -> Result<()> {
    let base = base_mime(mime_type);
    if ALLOWED_MIME_TYPES.contains(&base) {
        Ok(())
    } else {
        Err(anyhow!("Unsupported recording type: {}", mime_type))
    }
}

fn validate_review_id(review_id: &str) -> Result<()> {
    if review_id.is_empty() || review_id.len() > MAX_REVIEW_ID_LEN {
        return Err(anyhow!("Review id must be 1 to {} characters", MAX_REVIEW_ID_LEN));
    }
    if !review_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("Review id contains invalid characters"));
    }
    Ok(())
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            let shared = a == 100 && (64..128).contains(&b);
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || shared
        }
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            let unique_local = head & 0xfe00 == 0xfc00;
            let link_local = head & 0xffc0 == 0xfe80;
            v6.is_loopback() || v6.is_unspecified() || unique_local || link_local
        }
    }
}

fn host_is_blocked(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    BLOCKED_HOSTS.iter().any(|blocked| {
        domain == *blocked
            || domain
                .strip_suffix(blocked)
                .is_some_and(|rest| rest.ends_with('.'))
    })
}

/// Scheme, host and port checks on the configured endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.len() > URL_LIMIT {
        return Err(anyhow!("Upload endpoint is longer than {} bytes", URL_LIMIT));
    }
    let parsed =
        url::Url::parse(endpoint).map_err(|e| anyhow!("Upload endpoint is not a URL: {}", e))?;
    if parsed.scheme() != "https" {
        return Err(anyhow!("Upload endpoint must use https"));
    }

    let internal = match parsed.host() {
        None => return Err(anyhow!("Upload endpoint has no host")),
        Some(url::Host::Domain(domain)) => {
            if domain.is_empty() || domain.len() > 253 {
                return Err(anyhow!("Upload endpoint host name has an invalid length"));
            }
            if host_is_blocked(domain) {
                return Err(anyhow!("Upload endpoint host {} is not allowed", domain));
            }
            false
        }
        Some(url::Host::Ipv4(ip)) => is_internal(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => is_internal(IpAddr::V6(ip)),
    };
    if internal {
        return Err(anyhow!("Upload endpoint points at an internal address"));
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    if BLOCKED_PORTS.contains(&port) {
        return Err(anyhow!("Upload endpoint port {} is not allowed", port));
    }
    Ok(())
}

/// The endpoint passed [`validate_endpoint`]; this catches names that
/// resolve to internal addresses.
fn check_resolved_addresses(endpoint: &str) -> Result<()> {
    let parsed = url::Url::parse(endpoint)?;
    let addrs = parsed
        .socket_addrs(|| Some(443))
        .map_err(|e| anyhow!("Cannot resolve upload endpoint: {}", e))?;
    if addrs.is_empty() {
        return Err(anyhow!("Upload endpoint resolved to no addresses"));
    }
    if let Some(addr) = addrs.iter().find(|a| is_internal(a.ip())) {
        return Err(anyhow!("Upload endpoint resolves to internal address {}", addr.ip()));
    }
    Ok(())
}

fn validate_returned_url(link: &str) -> Result<()> {
    if link.len() > URL_LIMIT || link.chars().any(char::is_control) {
        return Err(anyhow!("Review service returned a malformed link"));
    }
    let parsed = url::Url::parse(link)
        .map_err(|e| anyhow!("Review service returned an unparsable link: {}", e))?;
    match (parsed.scheme(), parsed.host_str()) {
        ("http" | "https", Some(_)) => Ok(()),
        _ => Err(anyhow!("Review service returned a non-web link: {}", link)),
    }
}

/// Follows a dot-separated `path` into a JSON body, falling back to a body
/// that is a bare URL.
pub fn extract_url_from_response(body: &str, path: &str) -> Result<String> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let found = path
            .split('.')
            .try_fold(&json, |node, key| node.get(key))
            .ok_or_else(|| anyhow!("Reply has no field at '{}'", path))?;
        return found
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Reply field '{}' is not a string", path));
    }

    let line = body.trim();
    let looks_like_link = line.starts_with("https://") || line.starts_with("http://");
    if looks_like_link && line.len() <= URL_LIMIT && !line.contains('\n') {
        Ok(line.to_string())
    } else {
        Err(anyhow!("Reply contains no review link"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn artifact(mime_type: &str, bytes: usize) -> Artifact {
        Artifact {
            session_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            mime_type: mime_type.to_string(),
            blob: vec![7; bytes],
            object_url: crate::recording::new_object_url(),
            thumbnail: None,
            duration: Some(1.0),
        }
    }

    fn uploader(endpoint: &str) -> ArtifactUploader {
        ArtifactUploader::new(UploadConfig {
            endpoint: endpoint.to_string(),
            max_size_mb: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_link_from_nested_json_field() {
        let json = r#"{"data": {"url": "https://reviews.example.com/r/42"}}"#;
        assert_eq!(
            extract_url_from_response(json, "data.url").unwrap(),
            "https://reviews.example.com/r/42"
        );
        assert!(extract_url_from_response(json, "data.link").is_err());
    }

    #[test]
    fn test_link_from_plain_text_reply() {
        let text = "https://reviews.example.com/r/42\n";
        assert!(extract_url_from_response(text, "url").is_ok());
        assert!(extract_url_from_response("not a url", "url").is_err());
    }

    #[test]
    fn test_endpoint_must_be_public_https() {
        assert!(validate_endpoint("https://reviews.example.com/api/upload").is_ok());
        assert!(validate_endpoint("http://reviews.example.com/api/upload").is_err());
        assert!(validate_endpoint("https://localhost/upload").is_err());
        assert!(validate_endpoint("https://192.168.1.10/upload").is_err());
        assert!(validate_endpoint("https://[::1]/upload").is_err());
        assert!(validate_endpoint("https://reviews.example.com:22/upload").is_err());
    }

    #[test]
    fn test_preflight_checks_size_type_and_review_id() {
        let uploader = uploader("https://reviews.example.com/api/upload");
        assert!(uploader.preflight(&artifact("video/webm;codecs=vp8,opus", 10), "rev-42").is_ok());
        assert!(uploader.preflight(&artifact("image/gif", 10), "rev-42").is_ok());
        assert!(uploader.preflight(&artifact("text/html", 10), "rev-42").is_err());
        assert!(uploader.preflight(&artifact("video/webm", 2 * 1024 * 1024), "rev-42").is_err());
        assert!(uploader.preflight(&artifact("video/webm", 0), "rev-42").is_err());
        assert!(uploader.preflight(&artifact("video/webm", 10), "../42").is_err());
    }

    #[test]
    fn test_disabled_uploader_refuses() {
        let uploader = uploader("");
        assert!(uploader.upload(&artifact("video/webm", 10), "rev-42").is_err());
    }

    #[test]
    fn test_returned_url_must_be_web_url() {
        assert!(validate_returned_url("https://reviews.example.com/r/1").is_ok());
        assert!(validate_returned_url("javascript:alert(1)").is_err());
        assert!(validate_returned_url("file:///etc/passwd").is_err());
    }
}
