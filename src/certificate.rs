//! Certificate manager for a single domain.
//!
//! Validates the domain's `cert.pem`/`key.pem` pair, schedules the next check
//! from the certificate expiry, and asks the issuer for a new certificate when
//! the pair is missing, expired or mismatched. All work for one domain runs in
//! one task, so checks never overlap.

use crate::error::{GatewayError, IssuanceError, Result};
use crate::issuer::{CertificateIssuer, IssueRequest};
use crate::watch::{FsEvent, Subscription, SubscriptionGuard};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::x509::SubjectPublicKeyInfo;

/// Timing knobs for the check/renew cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificatePolicy {
    /// Delay before re-validating after issuance or a failed attempt
    pub recheck_interval: Duration,
    /// Delay after the authority reported a rate limit
    pub rate_limit_backoff: Duration,
    /// Delay between a certificate directory change and the re-check
    pub change_debounce: Duration,
    /// Renewal checks never happen more often than this
    pub min_renewal_delay: Duration,
    /// Time reserved for issuing a replacement
    pub issuance_margin: Duration,
    /// Upper bound for a single renewal sleep
    pub max_renewal_delay: Duration,
}

impl Default for CertificatePolicy {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(30 * 60),
            change_debounce: Duration::from_secs(1),
            min_renewal_delay: Duration::from_secs(60 * 60),
            issuance_margin: Duration::from_secs(25),
            max_renewal_delay: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

impl CertificatePolicy {
    /// `max((expiry - now) * 0.8 - margin, min_renewal_delay)`
    pub fn renewal_delay(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let remaining_ms = (expires_at - now).num_milliseconds() as f64;
        let target_ms = remaining_ms * 0.8 - self.issuance_margin.as_millis() as f64;
        let floor_ms = self.min_renewal_delay.as_millis() as f64;

        Duration::from_millis(target_ms.max(floor_ms) as u64).min(self.max_renewal_delay)
    }

    /// Delay before retrying after a failed issuance
    pub fn retry_delay(&self, err: &IssuanceError) -> Duration {
        if err.is_rate_limited() {
            self.rate_limit_backoff
        } else {
            self.recheck_interval
        }
    }
}

/// A certificate that passed validation
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub common_name: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// DER of the leaf certificate
    pub der: Vec<u8>,
    pub key_path: PathBuf,
}

/// Validate a certificate/key pair for `domain`.
///
/// The pair is valid when both files exist, the leaf certificate has not
/// expired at `now`, and the private key belongs to the certificate's public
/// key. A common name other than `domain` is only logged.
pub async fn check_certificate(
    domain: &str,
    cert_path: &Path,
    key_path: &Path,
    now: DateTime<Utc>,
) -> Result<CertificateRecord> {
    let (cert_pem, key_pem) = match (tokio::fs::read(cert_path).await, tokio::fs::read(key_path).await) {
        (Ok(cert), Ok(key)) => (cert, key),
        _ => {
            return Err(GatewayError::invalid_certificate(
                domain,
                "certificate and/or private key missing",
            ))
        }
    };

    let (_, pem) = parse_x509_pem(&cert_pem)
        .map_err(|e| GatewayError::invalid_certificate(domain, format!("unreadable certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| GatewayError::invalid_certificate(domain, format!("unreadable certificate: {e}")))?;

    let expires_at = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| GatewayError::invalid_certificate(domain, "certificate expiry out of range"))?;
    if expires_at < now {
        return Err(GatewayError::invalid_certificate(
            domain,
            format!("certificate expired at {expires_at}"),
        ));
    }

    let key = load_key_pair(&key_pem, cert.public_key())
        .map_err(|e| GatewayError::invalid_certificate(domain, format!("unreadable private key: {e}")))?;
    let cert_public_key: &[u8] = &cert.public_key().subject_public_key.data;
    if key.public_key_raw() != cert_public_key {
        return Err(GatewayError::invalid_certificate(
            domain,
            "private key does not match the certificate",
        ));
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    if common_name.as_deref() != Some(domain) {
        warn!(
            domain,
            common_name = common_name.as_deref().unwrap_or("<none>"),
            "certificate common name does not match the domain, TLS clients may reject it"
        );
    }

    Ok(CertificateRecord {
        common_name,
        expires_at,
        der: pem.contents.clone(),
        key_path: key_path.to_path_buf(),
    })
}

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;

/// rsaEncryption with NULL parameters
const RSA_ALGORITHM: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];
/// id-ecPublicKey, followed by the curve
const EC_PUBLIC_KEY: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];

/// Key pair from a PEM private key in PKCS#8, PKCS#1 (RSA) or SEC1 (EC)
/// form. The latter two are wrapped into PKCS#8 with the algorithm of the
/// certificate's `spki`.
fn load_key_pair(key_pem: &[u8], spki: &SubjectPublicKeyInfo<'_>) -> std::result::Result<rcgen::KeyPair, String> {
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no private key found".to_string())?;

    let pkcs8 = match &key {
        PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
        PrivateKeyDer::Pkcs1(der) => wrap_pkcs8(RSA_ALGORITHM, der.secret_pkcs1_der()),
        PrivateKeyDer::Sec1(der) => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .ok_or_else(|| "certificate names no curve for an EC key".to_string())?;
            let mut algorithm = EC_PUBLIC_KEY.to_vec();
            algorithm.extend(der_tlv(TAG_OID, curve.data));
            wrap_pkcs8(&algorithm, der.secret_sec1_der())
        }
        _ => return Err("unsupported private key encoding".to_string()),
    };

    rcgen::KeyPair::from_der(&pkcs8).map_err(|e| e.to_string())
}

/// PKCS#8 v1 PrivateKeyInfo around a bare private key
fn wrap_pkcs8(algorithm: &[u8], key: &[u8]) -> Vec<u8> {
    let mut body = vec![0x02, 0x01, 0x00];
    body.extend(der_tlv(TAG_SEQUENCE, algorithm));
    body.extend(der_tlv(TAG_OCTET_STRING, key));
    der_tlv(TAG_SEQUENCE, &body)
}

fn der_tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    if body.len() < 0x80 {
        out.push(body.len() as u8);
    } else {
        let len = body.len().to_be_bytes();
        let skip = len.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (len.len() - skip) as u8);
        out.extend_from_slice(&len[skip..]);
    }
    out.extend_from_slice(body);
    out
}

/// The single outstanding timer of a certificate manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTimer {
    None,
    /// Re-check soon: after issuance, a failure, or a directory change
    Short(Instant),
    /// Renewal check computed from the certificate expiry
    Long(Instant),
}

impl PendingTimer {
    pub fn short_after(delay: Duration) -> Self {
        PendingTimer::Short(Instant::now() + delay)
    }

    pub fn long_after(delay: Duration) -> Self {
        PendingTimer::Long(Instant::now() + delay)
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            PendingTimer::None => None,
            PendingTimer::Short(at) | PendingTimer::Long(at) => Some(*at),
        }
    }

    /// Time left until the timer fires
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Keeps one domain's certificate valid
pub struct CertificateManager {
    domain: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    webroot: PathBuf,
    issuer: Arc<dyn CertificateIssuer>,
    policy: CertificatePolicy,
    schedule: watch::Sender<PendingTimer>,
    triggers: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    changes: Mutex<Option<SubscriptionGuard>>,
    shutdown: CancellationToken,
}

impl CertificateManager {
    pub fn new(
        domain: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        webroot: impl Into<PathBuf>,
        issuer: Arc<dyn CertificateIssuer>,
        policy: CertificatePolicy,
    ) -> Self {
        let (triggers, trigger_rx) = mpsc::channel(4);
        let (schedule, _) = watch::channel(PendingTimer::None);

        Self {
            domain: domain.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            webroot: webroot.into(),
            issuer,
            policy,
            schedule,
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            changes: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn policy(&self) -> &CertificatePolicy {
        &self.policy
    }

    /// Start the check loop with an immediate first check.
    /// `changes` delivers certificate directory events; each one schedules a
    /// debounced re-check. Returns `false` if already started or destroyed.
    pub fn start(self: &Arc<Self>, changes: Option<Subscription>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(triggers) = self.trigger_rx.lock().take() else {
            return false;
        };

        let changes = changes.map(|subscription| {
            let (guard, rx) = subscription.split();
            *self.changes.lock() = Some(guard);
            rx
        });

        self.arm(PendingTimer::short_after(Duration::ZERO));
        tokio::spawn(self.clone().run(triggers, changes));
        true
    }

    /// Ask for a check as soon as the current one (if any) finishes
    pub fn check_now(&self) {
        // A full queue already guarantees a pending check
        let _ = self.triggers.try_send(());
    }

    /// Currently armed timer
    pub fn pending(&self) -> PendingTimer {
        *self.schedule.borrow()
    }

    /// Observe every re-arm of the timer
    pub fn schedule(&self) -> watch::Receiver<PendingTimer> {
        self.schedule.subscribe()
    }

    /// Cancel the timer and stop listening for changes. Safe to call twice.
    pub fn destroy(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.trigger_rx.lock().take();
        self.changes.lock().take();
        self.schedule.send_replace(PendingTimer::None);
        debug!(domain = %self.domain, "certificate manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn arm(&self, timer: PendingTimer) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.schedule.send_replace(timer);
    }

    async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<()>,
        mut changes: Option<mpsc::UnboundedReceiver<FsEvent>>,
    ) {
        loop {
            let deadline = self.pending().deadline();

            let fire = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(()) = triggers.recv() => true,
                Some(event) = next_change(&mut changes) => {
                    debug!(domain = %self.domain, path = %event.path.display(), "certificate directory changed");
                    self.arm(PendingTimer::short_after(self.policy.change_debounce));
                    false
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => true,
            };

            if fire {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.check() => {}
                }
            }
        }

        self.schedule.send_replace(PendingTimer::None);
    }

    /// One pass of the state machine: validate, then either schedule the
    /// renewal check or issue and schedule a short re-check.
    async fn check(&self) {
        self.arm(PendingTimer::None);

        match check_certificate(&self.domain, &self.cert_path, &self.key_path, Utc::now()).await {
            Ok(record) => {
                let delay = self.policy.renewal_delay(record.expires_at, Utc::now());
                info!(
                    domain = %self.domain,
                    expires_at = %record.expires_at,
                    next_check_secs = delay.as_secs(),
                    "certificate is valid"
                );
                self.arm(PendingTimer::long_after(delay));
            }
            Err(reason) => {
                info!(domain = %self.domain, %reason, "issuing new certificate");
                let request = IssueRequest {
                    domain: &self.domain,
                    webroot: &self.webroot,
                    cert_path: &self.cert_path,
                    key_path: &self.key_path,
                };

                let delay = match self.issuer.issue(&request).await {
                    Ok(()) => self.policy.recheck_interval,
                    Err(e) => {
                        let delay = self.policy.retry_delay(&e);
                        warn!(
                            domain = %self.domain,
                            error = %e,
                            retry_secs = delay.as_secs(),
                            "could not issue certificate"
                        );
                        delay
                    }
                };
                self.arm(PendingTimer::short_after(delay));
            }
        }
    }
}

async fn next_change(changes: &mut Option<mpsc::UnboundedReceiver<FsEvent>>) -> Option<FsEvent> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
