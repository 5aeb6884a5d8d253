//! Single-attempt dispatch: webhook POST and presigned S3 PUT.

use proxy_canonical::to_canonical_string;
use proxy_types::{
    now_iso, ArtifactRecord, Delivery, DestinationKind, S3Destination, WebhookDestination,
};

use crate::failpoint::{self, FailpointAction};
use crate::secrets::{resolve_source, SecretError, SecretsProvider};
use crate::sign::{hmac_sha256_hex, presign_put_url, PresignPut};

/// Presigned URLs live for five minutes.
const PRESIGN_EXPIRES_SECS: u64 = 300;

/// Classified attempt failure; the wire value is [`FailureReason::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FailureReason {
    Timeout,
    NetworkError,
    Non2xx,
    UnknownDestination,
    MissingArtifact,
    SecretRefInvalid,
    SecretProviderForbidden,
    SecretProviderUnavailable,
    SecretNotFound,
    SecretReadFailed,
    SecretError,
    Exception,
}

impl FailureReason {
    /// Stable failure-reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::Non2xx => "non_2xx",
            Self::UnknownDestination => "unknown_destination",
            Self::MissingArtifact => "missing_artifact",
            Self::SecretRefInvalid => "secret_ref_invalid",
            Self::SecretProviderForbidden => "secret_provider_forbidden",
            Self::SecretProviderUnavailable => "secret_provider_unavailable",
            Self::SecretNotFound => "secret_not_found",
            Self::SecretReadFailed => "secret_read_failed",
            Self::SecretError => "secret_error",
            Self::Exception => "exception",
        }
    }

    /// Whether backoff-and-retry can help. Configuration faults go straight
    /// to the DLQ.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownDestination | Self::MissingArtifact | Self::SecretRefInvalid
        )
    }
}

impl From<&SecretError> for FailureReason {
    fn from(err: &SecretError) -> Self {
        match err {
            SecretError::RefInvalid(_) => Self::SecretRefInvalid,
            SecretError::Forbidden(_) => Self::SecretProviderForbidden,
            SecretError::Unavailable(_) => Self::SecretProviderUnavailable,
            SecretError::NotFound(_) => Self::SecretNotFound,
            SecretError::ReadFailed(_) => Self::SecretReadFailed,
            SecretError::Other(_) => Self::SecretError,
        }
    }
}

/// Result of one delivery attempt. Not an error type: attempt outcomes are
/// recorded, never thrown.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Whether the side-effect landed with a 2xx.
    pub ok: bool,
    /// HTTP status observed, when any.
    pub status: Option<u16>,
    /// Failure classification when `!ok`.
    pub failure: Option<FailureReason>,
    /// Human-readable detail for logs.
    pub error: Option<String>,
    /// Destination kind, when resolution got that far.
    pub destination_type: Option<DestinationKind>,
    /// False when a failpoint simulated a crash between the side-effect and
    /// the state commit: the worker must not record the transition.
    pub commit: bool,
}

impl AttemptOutcome {
    pub(crate) fn success(status: u16, kind: DestinationKind, commit: bool) -> Self {
        Self {
            ok: true,
            status: Some(status),
            failure: None,
            error: None,
            destination_type: Some(kind),
            commit,
        }
    }

    pub(crate) fn failure(
        reason: FailureReason,
        error: impl Into<String>,
        status: Option<u16>,
        kind: Option<DestinationKind>,
    ) -> Self {
        Self {
            ok: false,
            status,
            failure: Some(reason),
            error: Some(error.into()),
            destination_type: kind,
            commit: true,
        }
    }

    fn from_reqwest(err: reqwest::Error, kind: DestinationKind) -> Self {
        let reason = if err.is_timeout() {
            FailureReason::Timeout
        } else {
            FailureReason::NetworkError
        };
        Self::failure(reason, err.to_string(), None, Some(kind))
    }
}

/// Strip control characters so outbound HTTP stacks do not reject the
/// header; the stored order key keeps its newlines.
pub fn strip_control_chars(input: &str) -> String {
    input.chars().filter(|c| !c.is_control()).collect()
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// Object key for an artifact:
/// `{prefix?}/tenants/{tenant}/artifacts/{type}/{id}_{hash}.json`.
pub fn s3_object_key(prefix: Option<&str>, tenant_id: &str, artifact: &ArtifactRecord) -> String {
    let mut key = String::new();
    if let Some(prefix) = prefix {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            key.push_str(prefix);
            key.push('/');
        }
    }
    key.push_str(&format!(
        "tenants/{}/artifacts/{}/{}_{}.json",
        sanitize_segment(tenant_id),
        sanitize_segment(&artifact.artifact_type),
        sanitize_segment(&artifact.artifact_id),
        sanitize_segment(&artifact.artifact_hash),
    ));
    key
}

pub(crate) async fn dispatch_webhook(
    http: &reqwest::Client,
    delivery: &Delivery,
    webhook: &WebhookDestination,
    artifact: &ArtifactRecord,
    secrets: &dyn SecretsProvider,
) -> AttemptOutcome {
    let kind = DestinationKind::Webhook;
    let secret = match &webhook.secret {
        Some(source) => match resolve_source(source, secrets).await {
            Ok(secret) => secret,
            Err(err) => {
                return AttemptOutcome::failure((&err).into(), err.to_string(), None, Some(kind))
            }
        },
        None => String::new(),
    };

    let body = match to_canonical_string(&artifact.body) {
        Ok(body) => body,
        Err(err) => {
            return AttemptOutcome::failure(
                FailureReason::Exception,
                format!("artifact canonicalization failed: {err}"),
                None,
                Some(kind),
            )
        }
    };
    let timestamp = now_iso();
    let signature = match hmac_sha256_hex(
        secret.as_bytes(),
        format!("{timestamp}{body}").as_bytes(),
    ) {
        Ok(signature) => signature,
        Err(err) => {
            return AttemptOutcome::failure(
                FailureReason::Exception,
                err.to_string(),
                None,
                Some(kind),
            )
        }
    };

    let response = http
        .post(&webhook.url)
        .header("content-type", "application/json; charset=utf-8")
        .header("x-proxy-dedupe-key", &delivery.dedupe_key)
        .header("x-proxy-delivery-id", &delivery.delivery_id)
        .header("x-proxy-artifact-type", &artifact.artifact_type)
        .header("x-proxy-artifact-id", &artifact.artifact_id)
        .header("x-proxy-artifact-hash", &artifact.artifact_hash)
        .header("x-proxy-order-key", strip_control_chars(&delivery.order_key))
        .header("x-proxy-timestamp", &timestamp)
        .header("x-proxy-signature", &signature)
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let commit = failpoint::fire(crate::failpoint::WEBHOOK_AFTER_POST)
                    == FailpointAction::Continue;
                AttemptOutcome::success(status, kind, commit)
            } else {
                AttemptOutcome::failure(
                    FailureReason::Non2xx,
                    format!("receiver answered {status}"),
                    Some(status),
                    Some(kind),
                )
            }
        }
        Err(err) => AttemptOutcome::from_reqwest(err, kind),
    }
}

pub(crate) async fn dispatch_s3(
    http: &reqwest::Client,
    delivery: &Delivery,
    s3: &S3Destination,
    artifact: &ArtifactRecord,
    secrets: &dyn SecretsProvider,
) -> AttemptOutcome {
    let kind = DestinationKind::S3;
    let access_key_id = match resolve_source(&s3.access_key_id, secrets).await {
        Ok(value) => value,
        Err(err) => {
            return AttemptOutcome::failure((&err).into(), err.to_string(), None, Some(kind))
        }
    };
    let secret_access_key = match resolve_source(&s3.secret_access_key, secrets).await {
        Ok(value) => value,
        Err(err) => {
            return AttemptOutcome::failure((&err).into(), err.to_string(), None, Some(kind))
        }
    };

    let body = match to_canonical_string(&artifact.body) {
        Ok(body) => body,
        Err(err) => {
            return AttemptOutcome::failure(
                FailureReason::Exception,
                format!("artifact canonicalization failed: {err}"),
                None,
                Some(kind),
            )
        }
    };

    let key = s3_object_key(s3.prefix.as_deref(), &delivery.tenant_id, artifact);
    let url = match presign_put_url(&PresignPut {
        endpoint: &s3.endpoint,
        region: &s3.region,
        bucket: &s3.bucket,
        key: &key,
        access_key_id: &access_key_id,
        secret_access_key: &secret_access_key,
        force_path_style: s3.force_path_style,
        expires_secs: PRESIGN_EXPIRES_SECS,
        at: chrono::Utc::now(),
    }) {
        Ok(url) => url,
        Err(err) => {
            return AttemptOutcome::failure(
                FailureReason::Exception,
                format!("presign failed: {err}"),
                None,
                Some(kind),
            )
        }
    };

    let response = http
        .put(url)
        .header("content-type", "application/json; charset=utf-8")
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                let commit =
                    failpoint::fire(crate::failpoint::S3_AFTER_PUT) == FailpointAction::Continue;
                AttemptOutcome::success(status, kind, commit)
            } else {
                AttemptOutcome::failure(
                    FailureReason::Non2xx,
                    format!("object store answered {status}"),
                    Some(status),
                    Some(kind),
                )
            }
        }
        Err(err) => AttemptOutcome::from_reqwest(err, kind),
    }
}
