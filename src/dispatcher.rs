//! Request dispatch: build → send → classify → corrective action.
//!
//! Classification must keep credential expiry, IP bans and transient
//! failures apart, because each takes a different corrective path:
//! expiry renegotiates and retries the identical payload on the unchanged
//! proxy; a ban or a proxied failure permanently removes the egress entry;
//! direct failures get a bounded backoff before the pair is abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use reqwest::header::HeaderValue;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::config::{Config, DETAIL_QUERY_URL, MAX_DIRECT_RETRIES, QUERY_URL};
use crate::credentials::CredentialSource;
use crate::error::QueryError;
use crate::extract;
use crate::fingerprint::Fingerprint;
use crate::models::{ApiEnvelope, RawItem, ResultRecord, ServiceType};
use crate::proxy::ProxyPool;
use crate::retry::{uniform_delay, RetryPolicy};
use crate::transport::QueryTransport;

/// Post-success delays; direct traffic is paced harder since every request
/// comes from the same address.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub proxied: (Duration, Duration),
    pub direct: (Duration, Duration),
}

impl Pacing {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            proxied: (
                Duration::from_millis(cfg.proxied_pace_min_ms),
                Duration::from_millis(cfg.proxied_pace_max_ms),
            ),
            direct: (
                Duration::from_millis(cfg.direct_pace_min_ms),
                Duration::from_millis(cfg.direct_pace_max_ms),
            ),
        }
    }

    /// No delays at all, for tests.
    #[doc(hidden)]
    pub fn zero() -> Self {
        let z = (Duration::ZERO, Duration::ZERO);
        Self { proxied: z, direct: z }
    }
}

/// Drives one (target, service type) pair at a time. Holds the single
/// rotation-state handle, so the primary query loop and the extractor's
/// detail lookups share proxy accounting.
pub struct Dispatcher<'a, T: QueryTransport, C: CredentialSource> {
    transport: &'a mut T,
    negotiator: &'a mut C,
    pool: &'a mut ProxyPool,
    pacing: Pacing,
    direct_policy: RetryPolicy,
    cancel: Arc<AtomicBool>,
}

impl<'a, T: QueryTransport, C: CredentialSource> Dispatcher<'a, T, C> {
    pub fn new(
        transport: &'a mut T,
        negotiator: &'a mut C,
        pool: &'a mut ProxyPool,
        pacing: Pacing,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            negotiator,
            pool,
            pacing,
            direct_policy: RetryPolicy::new(MAX_DIRECT_RETRIES, Duration::from_millis(500), 2.0),
            cancel,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs one (unit, service type) query to completion and extracts the
    /// normalized records.
    pub async fn query_pair(
        &mut self,
        unit: &str,
        service_type: ServiceType,
    ) -> Result<Vec<ResultRecord>, QueryError> {
        let payload = json!({
            "pageNum": "",
            "pageSize": "",
            "unitName": unit,
            "serviceType": service_type.code(),
        });
        let body = self.send_with_recovery(QUERY_URL, &payload).await?;

        let list = body
            .get("params")
            .and_then(|p| p.get("list"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut records = Vec::with_capacity(list.len());
        for raw in list {
            let item: RawItem = match serde_json::from_value(raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!("skipping malformed result item: {}", e);
                    continue;
                }
            };
            records.push(extract::build_record(self, &item, service_type).await?);
        }
        Ok(records)
    }

    /// One detail lookup for app/miniapp/quickapp records, through the same
    /// transport and proxy accounting as the primary loop.
    pub async fn detail_lookup(
        &mut self,
        data_id: &Value,
        service_type: ServiceType,
    ) -> Result<Value, QueryError> {
        let payload = json!({
            "dataId": data_id,
            "serviceType": service_type.code(),
        });
        self.send_with_recovery(DETAIL_QUERY_URL, &payload).await
    }

    /// Sends `payload` until the application reports success, applying the
    /// classification table: rotate on proxied failures and bans, refresh
    /// on expiry, bounded backoff on direct failures.
    async fn send_with_recovery(
        &mut self,
        url: &str,
        payload: &Value,
    ) -> Result<Value, QueryError> {
        let mut direct_failures = 0usize;
        loop {
            if self.cancelled() {
                return Err(QueryError::Cancelled);
            }

            let proxy = self.pool.active().map(|e| e.address.clone());
            let headers = self.request_headers();
            let sent = self
                .transport
                .post_json(url, headers, payload, proxy.as_deref())
                .await;

            let reply = match sent {
                Ok(reply) => reply,
                Err(e) => {
                    self.handle_failure(proxy.is_some(), &mut direct_failures, e.to_string())
                        .await?;
                    continue;
                }
            };

            match reply.status {
                403 => {
                    if proxy.is_some() {
                        warn!("proxy returned 403, rotating");
                        self.pool.evict_active()?;
                        continue;
                    }
                    warn!("access denied (403) without a proxy, aborting run");
                    return Err(QueryError::Ban);
                }
                200 => match classify_envelope(reply.body) {
                    Ok(body) => {
                        if proxy.is_some() {
                            self.pool.record_use();
                        }
                        self.pace(proxy.is_some()).await;
                        return Ok(body);
                    }
                    Err(QueryError::AuthExpired) => {
                        info!("credentials expired, renegotiating");
                        self.negotiator.refresh().await?;
                        // identical payload, unchanged proxy
                    }
                    Err(e) => {
                        self.handle_failure(proxy.is_some(), &mut direct_failures, e.to_string())
                            .await?;
                    }
                },
                status => {
                    self.handle_failure(
                        proxy.is_some(),
                        &mut direct_failures,
                        format!("http status {}", status),
                    )
                    .await?;
                }
            }
        }
    }

    /// Corrective action for transport failures, unexpected statuses and
    /// application-level failures: proxied traffic rotates unconditionally
    /// while entries remain, direct traffic retries on a bounded backoff.
    async fn handle_failure(
        &mut self,
        proxied: bool,
        direct_failures: &mut usize,
        reason: String,
    ) -> Result<(), QueryError> {
        if proxied {
            warn!("request failed through proxy ({}), rotating", reason);
            self.pool.evict_active()?;
            return Ok(());
        }
        *direct_failures += 1;
        if *direct_failures >= self.direct_policy.max_attempts {
            return Err(QueryError::Abandoned { attempts: *direct_failures, reason });
        }
        let delay = self.direct_policy.delay_for(*direct_failures - 1);
        warn!(
            "request failed ({}), retry {}/{} in {:?}",
            reason, direct_failures, self.direct_policy.max_attempts, delay
        );
        sleep(delay).await;
        Ok(())
    }

    fn request_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = Fingerprint::random().headers();
        for (name, value) in self.negotiator.headers() {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        }
        headers
    }

    async fn pace(&self, proxied: bool) {
        let (min, max) = if proxied { self.pacing.proxied } else { self.pacing.direct };
        if max > Duration::ZERO {
            let delay = uniform_delay(min, max);
            info!("request succeeded, pacing {:?}", delay);
            sleep(delay).await;
        }
    }
}

/// Sorts an HTTP 200 body into the error taxonomy: expiry and application
/// failures become their structural variants, success passes the body
/// through untouched.
fn classify_envelope(body: Value) -> Result<Value, QueryError> {
    let envelope: ApiEnvelope = serde_json::from_value(body.clone())
        .unwrap_or(ApiEnvelope { success: false, code: None, params: None, msg: None });
    if envelope.code == Some(401) {
        return Err(QueryError::AuthExpired);
    }
    if envelope.success {
        return Ok(body);
    }
    Err(QueryError::Application(
        envelope.msg.unwrap_or_else(|| "unspecified api failure".into()),
    ))
}
