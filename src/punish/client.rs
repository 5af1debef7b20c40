//! Pooled HTTPS clients and the request header template

use super::{DispatcherConfig, PunishError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

pub const AUDIT_LOG_REASON: HeaderName = HeaderName::from_static("x-audit-log-reason");

/// Round-robin set of keep-alive clients
#[derive(Debug)]
pub struct ClientPool {
    clients: Vec<reqwest::Client>,
    next: AtomicUsize,
}

impl ClientPool {
    /// # Errors
    ///
    /// Returns `PunishError::Client` if the TLS backend cannot be initialized.
    pub fn new(config: &DispatcherConfig) -> Result<Self, PunishError> {
        let clients = (0..config.effective_client_count())
            .map(|_| {
                reqwest::Client::builder()
                    .use_rustls_tls()
                    .pool_max_idle_per_host(config.max_idle_per_host)
                    .pool_idle_timeout(config.idle_timeout())
                    .connect_timeout(config.connect_timeout())
                    .tcp_keepalive(config.keepalive())
                    .tcp_nodelay(true)
                    .timeout(config.request_timeout())
                    .build()
                    .map_err(PunishError::Client)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> &reqwest::Client {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    /// Open a connection per client so the first punishment skips the
    /// handshake. Failures only cost the warm-up.
    pub async fn warm(&self, url: &str) {
        for client in &self.clients {
            match client.get(url).send().await {
                Ok(resp) => {
                    let _ = resp.bytes().await;
                }
                Err(e) => debug!(error = %e, "Connection warm-up failed"),
            }
        }
    }
}

/// `Bot ` prefix unless the token already carries a scheme
fn authorization(token: &str) -> String {
    if token.starts_with("Bot ") || token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bot {token}")
    }
}

/// Headers every request carries, built once
///
/// # Errors
///
/// Returns `PunishError::InvalidHeader` if the token is not a valid header
/// value.
pub fn header_template(token: &str) -> Result<HeaderMap, PunishError> {
    let mut auth = HeaderValue::from_str(&authorization(token))
        .map_err(|_| PunishError::InvalidHeader("authorization"))?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Percent-encode everything outside printable ASCII so any reason fits
/// in a header value
fn encode_reason(reason: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(reason.len());
    for &b in reason.as_bytes() {
        if (0x20..0x7f).contains(&b) && b != b'%' {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(b >> 4)]));
            out.push(char::from(HEX[usize::from(b & 0xf)]));
        }
    }
    out
}

/// Clone the template, adding the audit-log reason when there is one
#[must_use]
pub fn request_headers(template: &HeaderMap, reason: &str) -> HeaderMap {
    let mut headers = template.clone();
    if !reason.is_empty()
        && let Ok(value) = HeaderValue::from_str(&encode_reason(reason))
    {
        headers.insert(AUDIT_LOG_REASON, value);
    }
    headers
}
