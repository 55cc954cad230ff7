//! Update decision for one device check-in
//!
//! A check-in carries the device's station MAC and the MD5 of the sketch it
//! runs. The handler answers with one of:
//! - `304 Not Modified` when the device already runs its target image
//! - `200 OK` with the target image when the digests differ
//! - `400 Bad Request` for bad headers, unknown devices, or no active image
//! - `500 Internal Server Error` when the store cannot be read
//!
//! Nothing is kept between check-ins; all state lives in the store.

use crate::audit::{AuditSink, Decision, MetaValue, Metadata, RequestEvent};
use crate::digest::ContentDigest;
use crate::error::{Error, ErrorKind, Result};
use crate::identity::DeviceIdentity;
use crate::resolver::{ContentResolver, Resolution};
use bytes::Bytes;
use chrono::Utc;
use tracing::{error, info, warn};

/// Product name used by ESP8266 Arduino clients in their header names
pub const DEFAULT_PRODUCT: &str = "ESP8266";

/// Response header carrying the image digest, spelled as clients look for it
pub const DIGEST_RESPONSE_HEADER: &str = "x-MD5";

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Request header names for one product family (`ESP8266`, `ESP32`...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    identity: String,
    digest: String,
    prefix: String,
}

impl HeaderNames {
    pub fn new(product: &str) -> Self {
        Self {
            identity: format!("X-{product}-STA-MAC"),
            digest: format!("X-{product}-sketch-md5"),
            prefix: format!("x-{}-", product.to_ascii_lowercase()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Lowercase suffix of a product header, `None` for other headers
    fn metadata_key(&self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        lower.strip_prefix(&self.prefix).map(str::to_string)
    }
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self::new(DEFAULT_PRODUCT)
    }
}

/// Validated contents of a check-in request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckinRequest {
    pub device: DeviceIdentity,
    pub claimed: ContentDigest,
    /// Every product header, keyed by lowercase suffix
    pub metadata: Metadata,
}

impl CheckinRequest {
    /// Extract identity, claimed digest and metadata from request headers
    ///
    /// Header names match case-insensitively. The identity and the digest
    /// must each appear exactly once.
    pub fn parse<'a, I>(names: &HeaderNames, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut identities = Vec::new();
        let mut digests = Vec::new();
        let mut metadata = Metadata::new();

        for (name, value) in headers {
            if name.eq_ignore_ascii_case(&names.identity) {
                identities.push(value);
            } else if name.eq_ignore_ascii_case(&names.digest) {
                digests.push(value);
            }
            if let Some(key) = names.metadata_key(name) {
                metadata
                    .entry(key)
                    .or_insert_with(|| MetaValue::from_header(value));
            }
        }

        let [identity] = identities.as_slice() else {
            return Err(Error::MissingIdentity {
                header: names.identity.clone(),
            });
        };
        let [digest] = digests.as_slice() else {
            return Err(Error::MissingDigest {
                header: names.digest.clone(),
            });
        };

        Ok(Self {
            device: DeviceIdentity::parse(identity)?,
            claimed: ContentDigest::from_hex(digest, &names.digest)?,
            metadata,
        })
    }
}

/// Transport-neutral answer to a check-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinResponse {
    /// Device already runs its target image
    NotModified,
    /// Send `content`; `digest` goes into [`DIGEST_RESPONSE_HEADER`]
    Update { digest: ContentDigest, content: Bytes },
    BadRequest(String),
    InternalError(String),
}

impl CheckinResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            CheckinResponse::NotModified => 304,
            CheckinResponse::Update { .. } => 200,
            CheckinResponse::BadRequest(_) => 400,
            CheckinResponse::InternalError(_) => 500,
        }
    }

    pub fn decision(&self) -> Decision {
        match self {
            CheckinResponse::NotModified => Decision::NotModified,
            CheckinResponse::Update { .. } => Decision::Update,
            CheckinResponse::BadRequest(_) => Decision::Rejected,
            CheckinResponse::InternalError(_) => Decision::Failed,
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            CheckinResponse::BadRequest(reason) | CheckinResponse::InternalError(reason) => {
                Some(reason.clone())
            }
            _ => None,
        }
    }
}

/// Audit records produced by one check-in, submitted off the response path
#[derive(Debug, Clone)]
pub struct AuditTrail {
    pub device: DeviceIdentity,
    pub metadata: Metadata,
    pub event: RequestEvent,
}

impl AuditTrail {
    /// Record that the response could not be delivered in full
    pub fn interrupted(mut self, cause: impl std::fmt::Display) -> Self {
        self.event.decision = Decision::Interrupted;
        self.event.reason = Some(format!("Transfer interrupted: {cause}"));
        self
    }

    /// Hand the records to `sink`; failures are logged and swallowed
    pub fn submit(&self, sink: &dyn AuditSink) {
        let mut info = self.metadata.clone();
        info.insert("last_seen".to_string(), MetaValue::Timestamp(self.event.timestamp));

        if let Err(e) = sink.record_device_info(&self.device, &info) {
            warn!("Failed to record device info for {}: {}", self.device, e);
        }
        if let Err(e) = sink.record_request(&self.device, &self.event) {
            warn!("Failed to record request for {}: {}", self.device, e);
        }
    }
}

/// Result of handling one check-in
#[derive(Debug, Clone)]
pub struct Checkin {
    pub response: CheckinResponse,
    /// Absent when the request was too malformed to name a device
    pub audit: Option<AuditTrail>,
}

#[derive(Clone)]
pub struct CheckinHandler {
    resolver: ContentResolver,
    names: HeaderNames,
}

impl CheckinHandler {
    pub fn new(resolver: ContentResolver, names: HeaderNames) -> Self {
        Self { resolver, names }
    }

    pub fn header_names(&self) -> &HeaderNames {
        &self.names
    }

    /// Run one check-in: validate, resolve, compare
    pub fn handle<'a, I>(&self, headers: I) -> Checkin
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let request = match CheckinRequest::parse(&self.names, headers) {
            Ok(request) => request,
            Err(e) => {
                info!("Rejected check-in: {}", e);
                return Checkin {
                    response: CheckinResponse::BadRequest(e.to_string()),
                    audit: None,
                };
            }
        };

        let (response, binary) = self.decide(&request);

        info!(
            "Check-in from {} (running {}): {:?} -> {}",
            request.device,
            request.claimed,
            response.decision(),
            response.status_code()
        );

        let event = RequestEvent {
            timestamp: Utc::now(),
            decision: response.decision(),
            status: response.status_code(),
            binary,
            reason: response.reason(),
            metadata: request.metadata.clone(),
        };

        Checkin {
            response,
            audit: Some(AuditTrail {
                device: request.device,
                metadata: request.metadata,
                event,
            }),
        }
    }

    fn decide(&self, request: &CheckinRequest) -> (CheckinResponse, Option<String>) {
        let resolved = match self.resolver.resolve(&request.device) {
            Ok(Resolution::Content(resolved)) => resolved,
            Ok(Resolution::Unassigned) => {
                return (CheckinResponse::BadRequest(Error::UnknownDevice.to_string()), None)
            }
            Ok(Resolution::NoActiveBinary) => {
                return (CheckinResponse::BadRequest(Error::NoActiveBinary.to_string()), None)
            }
            Err(e) if e.kind() == ErrorKind::Storage => {
                error!("Resolving content for {} failed: {}", request.device, e);
                return (CheckinResponse::InternalError("Could not fetch sketch".to_string()), None);
            }
            Err(e) => {
                warn!("Resolving content for {} rejected: {}", request.device, e);
                return (CheckinResponse::BadRequest(e.to_string()), None);
            }
        };

        let response = if resolved.digest == request.claimed {
            CheckinResponse::NotModified
        } else {
            CheckinResponse::Update {
                digest: resolved.digest,
                content: resolved.content,
            }
        };
        (response, Some(resolved.binary))
    }
}
