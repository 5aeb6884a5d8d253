//! Request signing: webhook HMAC signatures and AWS Signature v4 query
//! presigning for S3-compatible object stores.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// `HMAC-SHA256(key, message)` as lowercase hex.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> Result<String> {
    Ok(hex::encode(hmac_sha256(key, message)?))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("hmac key rejected: {e}"))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 3986 percent-encoding as SigV4 requires: unreserved characters pass
/// through, everything else becomes uppercase `%XX`; `/` survives only in
/// path position.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inputs for a presigned S3 `PUT`.
#[derive(Debug, Clone)]
pub struct PresignPut<'a> {
    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com` or a
    /// MinIO address.
    pub endpoint: &'a str,
    /// Signing region.
    pub region: &'a str,
    /// Target bucket.
    pub bucket: &'a str,
    /// Object key (unencoded).
    pub key: &'a str,
    /// Access key id.
    pub access_key_id: &'a str,
    /// Secret access key.
    pub secret_access_key: &'a str,
    /// Path-style addressing (`endpoint/bucket/key`) vs virtual-hosted
    /// (`bucket.endpoint/key`).
    pub force_path_style: bool,
    /// Link lifetime in seconds.
    pub expires_secs: u64,
    /// Signing instant.
    pub at: DateTime<Utc>,
}

/// Produce a presigned PUT URL per the SigV4 query-string algorithm with an
/// unsigned payload.
pub fn presign_put_url(req: &PresignPut<'_>) -> Result<String> {
    let endpoint: reqwest::Url = req
        .endpoint
        .parse()
        .with_context(|| format!("invalid s3 endpoint {:?}", req.endpoint))?;
    let scheme = endpoint.scheme();
    let base_host = endpoint
        .host_str()
        .ok_or_else(|| anyhow!("s3 endpoint {:?} has no host", req.endpoint))?;
    let host = match (endpoint.port(), req.force_path_style) {
        (Some(port), true) => format!("{base_host}:{port}"),
        (Some(port), false) => format!("{}.{base_host}:{port}", req.bucket),
        (None, true) => base_host.to_string(),
        (None, false) => format!("{}.{base_host}", req.bucket),
    };
    let path = if req.force_path_style {
        format!("/{}/{}", uri_encode(req.bucket, true), uri_encode(req.key, false))
    } else {
        format!("/{}", uri_encode(req.key, false))
    };

    let amz_date = req.at.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = req.at.format("%Y%m%d").to_string();
    let scope = format!("{datestamp}/{}/s3/aws4_request", req.region);
    let credential = format!("{}/{scope}", req.access_key_id);

    // Query parameters in sorted order, values encoded.
    let query = format!(
        "X-Amz-Algorithm=AWS4-HMAC-SHA256\
         &X-Amz-Credential={}\
         &X-Amz-Date={amz_date}\
         &X-Amz-Expires={}\
         &X-Amz-SignedHeaders=host",
        uri_encode(&credential, true),
        req.expires_secs,
    );

    let canonical_request =
        format!("PUT\n{path}\n{query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", req.secret_access_key).as_bytes(),
        datestamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, req.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "{scheme}://{host}{path}?{query}&X-Amz-Signature={signature}"
    ))
}
