//! Credential negotiation: token acquisition, captcha solving, point
//! encryption and verification, cookie synthesis.
//!
//! The negotiator walks UNINITIALIZED → TOKEN_ACQUIRED → CHALLENGE_SOLVED →
//! READY per attempt. A failure anywhere voids the in-progress attempt and
//! leaves the installed credential set untouched, so readers only ever see
//! the previous complete set or the new complete set.

use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::{
    AUTH_SECRET, AUTH_URL, CAPTCHA_CHECK_URL, CAPTCHA_IMAGE_URL, MAX_AUTH_RETRIES,
    MAX_CAPTCHA_RETRIES, MAX_TOKEN_RETRIES,
};
use crate::crypto;
use crate::error::QueryError;
use crate::fingerprint::Fingerprint;
use crate::models::{ChallengeParams, TokenResponse, VerifyResponse};
use crate::retry::{uniform_delay, RetryPolicy};
use crate::transport::QueryTransport;
use crate::vision::{decode_base64_image, MatchPoint, Solver};

/// Offset between the detection image's coordinate space and the space the
/// verifier expects the click points in.
const POINT_BIAS: i32 = 20;

/// Request-signing credentials, replaced as a whole unit on every
/// successful negotiation and never partially mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    pub token: String,
    pub sign: String,
    pub session_id: String,
    pub cookie: String,
}

/// What the dispatcher needs from a credential owner.
#[async_trait]
pub trait CredentialSource: Send {
    /// Full renegotiation; fatal for the run when it fails.
    async fn refresh(&mut self) -> Result<(), QueryError>;

    /// Current credential headers; empty strings before the first refresh.
    fn headers(&self) -> Vec<(&'static str, String)>;
}

pub struct Negotiator<T: QueryTransport> {
    transport: T,
    solver: Solver,
    creds: CredentialSet,
    token_policy: RetryPolicy,
    max_refresh_attempts: usize,
    refresh_delay: (Duration, Duration),
}

#[derive(Serialize)]
struct Point {
    x: i32,
    y: i32,
}

impl<T: QueryTransport> Negotiator<T> {
    pub fn new(transport: T, solver: Solver) -> Self {
        Self {
            transport,
            solver,
            creds: CredentialSet::default(),
            token_policy: RetryPolicy::new(MAX_TOKEN_RETRIES, Duration::from_secs(2), 1.5),
            max_refresh_attempts: MAX_AUTH_RETRIES,
            refresh_delay: (Duration::from_secs(5), Duration::from_secs(10)),
        }
    }

    /// Shrinks the retry schedule, for tests.
    #[doc(hidden)]
    pub fn with_schedule(
        mut self,
        token_policy: RetryPolicy,
        max_refresh_attempts: usize,
        refresh_delay: (Duration, Duration),
    ) -> Self {
        self.token_policy = token_policy;
        self.max_refresh_attempts = max_refresh_attempts;
        self.refresh_delay = refresh_delay;
        self
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.creds
    }

    /// One READY-or-nothing pass: token → challenge → cookie. The complete
    /// set is built locally and only installed by the caller on success.
    async fn negotiate_once(&mut self) -> Result<CredentialSet, QueryError> {
        let token = self.acquire_token().await?;
        let (sign, session_id) = self.solve_challenge(&token).await?;
        Ok(CredentialSet {
            token,
            sign,
            session_id,
            cookie: synthesize_cookie(),
        })
    }

    async fn acquire_token(&mut self) -> Result<String, QueryError> {
        let mut last = None;
        for attempt in 0..self.token_policy.max_attempts {
            match self.try_token().await {
                Ok(token) => {
                    info!("token acquired");
                    return Ok(token);
                }
                Err(e) => {
                    warn!(
                        "token request failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.token_policy.max_attempts,
                        e
                    );
                    last = Some(e);
                    if attempt + 1 < self.token_policy.max_attempts {
                        sleep(self.token_policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| QueryError::Application("token retries exhausted".into())))
    }

    async fn try_token(&mut self) -> Result<String, QueryError> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let form = [
            ("authKey", crypto::auth_key(AUTH_SECRET, timestamp)),
            ("timeStamp", timestamp.to_string()),
        ];
        let reply = self
            .transport
            .post_form(AUTH_URL, negotiation_headers(None), &form)
            .await?;
        if reply.status != 200 {
            return Err(QueryError::Protocol(reply.status));
        }
        let parsed: TokenResponse = serde_json::from_value(reply.body)
            .map_err(|e| QueryError::Application(format!("malformed token response: {}", e)))?;
        parsed
            .params
            .and_then(|p| p.bussiness)
            .ok_or_else(|| QueryError::Application("token missing from response".into()))
    }

    /// Fetches and solves challenges until verification succeeds, with a
    /// bounded recognition-retry loop. Each challenge is single-use: a new
    /// one is fetched per attempt and discarded whatever the outcome. The
    /// token is not re-acquired inside this loop.
    async fn solve_challenge(&mut self, token: &str) -> Result<(String, String), QueryError> {
        for attempt in 1..=MAX_CAPTCHA_RETRIES {
            let client_uid = format!("point-{}", Uuid::new_v4());
            let challenge = self.fetch_challenge(token, &client_uid).await?;

            match self.recognize(&challenge) {
                Ok(points) => {
                    return self
                        .verify(token, &client_uid, &challenge, &points)
                        .await;
                }
                Err(QueryError::Recognition(reason)) => {
                    if attempt < MAX_CAPTCHA_RETRIES {
                        warn!(
                            "captcha recognition failed (attempt {}/{}): {}, fetching a new challenge",
                            attempt, MAX_CAPTCHA_RETRIES, reason
                        );
                        sleep(Duration::from_secs(1)).await;
                    } else {
                        error!("captcha recognition failed {} times in a row", MAX_CAPTCHA_RETRIES);
                        return Err(QueryError::Recognition(reason));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on final attempt")
    }

    async fn fetch_challenge(
        &mut self,
        token: &str,
        client_uid: &str,
    ) -> Result<ChallengeParams, QueryError> {
        let reply = self
            .transport
            .post_json(
                CAPTCHA_IMAGE_URL,
                negotiation_headers(Some(token)),
                &json!({ "clientUid": client_uid }),
                None,
            )
            .await?;
        if reply.status != 200 {
            return Err(QueryError::Protocol(reply.status));
        }
        let params = reply
            .body
            .get("params")
            .cloned()
            .ok_or_else(|| QueryError::Application("challenge missing params".into()))?;
        serde_json::from_value(params)
            .map_err(|e| QueryError::Application(format!("malformed challenge: {}", e)))
    }

    /// Runs the vision pipeline over one challenge. Wrong box or point
    /// counts surface as `Recognition` so the caller can fetch a fresh
    /// challenge.
    fn recognize(&self, challenge: &ChallengeParams) -> Result<Vec<MatchPoint>, QueryError> {
        let big = decode_base64_image(&challenge.big_image)?;
        let small = decode_base64_image(&challenge.small_image)?;

        let boxes = self
            .solver
            .detect(&big)?
            .ok_or_else(|| QueryError::Recognition("glyph detection did not yield 5 boxes".into()))?;

        let points = self.solver.match_points(&big, &small, &boxes)?;
        if points.len() != 4 {
            return Err(QueryError::Recognition(format!(
                "matched {} of 4 query glyphs",
                points.len()
            )));
        }
        Ok(points)
    }

    async fn verify(
        &mut self,
        token: &str,
        client_uid: &str,
        challenge: &ChallengeParams,
        points: &[MatchPoint],
    ) -> Result<(String, String), QueryError> {
        let shifted: Vec<Point> = points
            .iter()
            .map(|p| Point { x: p.x + POINT_BIAS, y: p.y + POINT_BIAS })
            .collect();
        // serde_json emits no whitespace; the verifier decrypts and parses
        // this byte-for-byte
        let point_json = serde_json::to_string(&shifted)
            .map_err(|e| QueryError::Application(format!("point serialization: {}", e)))?;
        let encrypted = crypto::aes_ecb_encrypt(point_json.as_bytes(), &challenge.secret_key)?;

        let reply = self
            .transport
            .post_json(
                CAPTCHA_CHECK_URL,
                negotiation_headers(Some(token)),
                &json!({
                    "token": challenge.uuid,
                    "secretKey": challenge.secret_key,
                    "clientUid": client_uid,
                    "pointJson": encrypted,
                }),
                None,
            )
            .await?;
        if reply.status != 200 {
            return Err(QueryError::Protocol(reply.status));
        }
        let parsed: VerifyResponse = serde_json::from_value(reply.body)
            .map_err(|e| QueryError::Application(format!("malformed verify response: {}", e)))?;
        if parsed.code != Some(200) {
            return Err(QueryError::Application(format!(
                "captcha verification rejected: {}",
                parsed.msg.unwrap_or_else(|| "unknown".into())
            )));
        }
        let sign = parsed
            .params
            .and_then(|p| p.sign)
            .ok_or_else(|| QueryError::Application("sign missing from verify response".into()))?;
        info!("captcha verified, credentials ready");
        Ok((sign, challenge.uuid.clone()))
    }
}

#[async_trait]
impl<T: QueryTransport> CredentialSource for Negotiator<T> {
    async fn refresh(&mut self) -> Result<(), QueryError> {
        for attempt in 1..=self.max_refresh_attempts {
            info!("credential negotiation attempt {}/{}", attempt, self.max_refresh_attempts);
            match self.negotiate_once().await {
                Ok(set) => {
                    // single assignment: readers never observe a mix of
                    // fields from two negotiations
                    self.creds = set;
                    return Ok(());
                }
                Err(e) => {
                    error!("negotiation attempt {} failed: {}", attempt, e);
                    if attempt < self.max_refresh_attempts {
                        let delay = uniform_delay(self.refresh_delay.0, self.refresh_delay.1);
                        info!("retrying negotiation in {:?}", delay);
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(QueryError::Negotiation(format!(
            "exhausted {} attempts",
            self.max_refresh_attempts
        )))
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Token", self.creds.token.clone()),
            ("Sign", self.creds.sign.clone()),
            ("Uuid", self.creds.session_id.clone()),
            ("Cookie", self.creds.cookie.clone()),
        ]
    }
}

/// Random session cookie; purely local, the server never checks it.
pub fn synthesize_cookie() -> String {
    format!("__jsluid_s={}", Uuid::new_v4().simple())
}

fn negotiation_headers(token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&Fingerprint::random().user_agent()) {
        headers.insert("User-Agent", ua);
    }
    headers.insert("Referer", HeaderValue::from_static(crate::config::REFERER));
    headers.insert("Origin", HeaderValue::from_static(crate::config::ORIGIN));
    headers.insert("Accept", HeaderValue::from_static("application/json, text/plain, */*"));
    if let Some(token) = token {
        if let Ok(v) = HeaderValue::from_str(token) {
            headers.insert("Token", v);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Reply;
    use crate::vision::{BoundingBox, DetectionModel, ImageTensor, SimilarityModel};
    use image::RgbImage;
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    struct StubDetector {
        row_sets: Arc<Mutex<Vec<Vec<Vec<f32>>>>>,
    }

    impl DetectionModel for StubDetector {
        fn predict(&self, _input: &ImageTensor) -> Result<Vec<Vec<f32>>, QueryError> {
            let mut sets = self.row_sets.lock().unwrap();
            if sets.len() > 1 {
                Ok(sets.remove(0))
            } else {
                Ok(sets[0].clone())
            }
        }
    }

    struct AlwaysMatch;

    impl SimilarityModel for AlwaysMatch {
        fn compare(&self, _a: &ImageTensor, _b: &ImageTensor) -> Result<f32, QueryError> {
            Ok(5.0)
        }
    }

    /// Replies served per URL, recording every request.
    #[derive(Clone, Default)]
    struct Scripted {
        replies: Arc<Mutex<Vec<(String, Reply)>>>,
        requests: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl Scripted {
        fn push(&self, url: &str, status: u16, body: Value) {
            self.replies.lock().unwrap().push((url.to_string(), Reply { status, body }));
        }

        fn take(&self, url: &str) -> Reply {
            let mut replies = self.replies.lock().unwrap();
            let idx = replies
                .iter()
                .position(|(u, _)| u == url)
                .unwrap_or_else(|| panic!("no scripted reply for {}", url));
            replies.remove(idx).1
        }

        fn requests_to(&self, url: &str) -> Vec<Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == url)
                .map(|(_, b)| b.clone())
                .collect()
        }
    }

    #[async_trait]
    impl QueryTransport for Scripted {
        async fn post_json(
            &mut self,
            url: &str,
            _headers: HeaderMap,
            body: &Value,
            _proxy: Option<&str>,
        ) -> Result<Reply, QueryError> {
            self.requests.lock().unwrap().push((url.to_string(), body.clone()));
            Ok(self.take(url))
        }

        async fn post_form(
            &mut self,
            url: &str,
            _headers: HeaderMap,
            _form: &[(&str, String)],
        ) -> Result<Reply, QueryError> {
            self.requests.lock().unwrap().push((url.to_string(), Value::Null));
            Ok(self.take(url))
        }
    }

    fn png_base64(width: u32, height: u32) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let img = RgbImage::new(width, height);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf)
    }

    fn five_rows() -> Vec<Vec<f32>> {
        (0..5).map(|i| vec![50.0 + 90.0 * i as f32, 90.0, 40.0, 40.0, 0.9]).collect()
    }

    fn four_rows() -> Vec<Vec<f32>> {
        five_rows().into_iter().take(4).collect()
    }

    fn negotiator(transport: Scripted, row_sets: Vec<Vec<Vec<f32>>>) -> Negotiator<Scripted> {
        let solver = Solver::new(
            Box::new(StubDetector { row_sets: Arc::new(Mutex::new(row_sets)) }),
            Box::new(AlwaysMatch),
        );
        Negotiator::new(transport, solver).with_schedule(
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                jitter: false,
            },
            2,
            (Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn challenge_body(secret_key: &str) -> Value {
        json!({
            "params": {
                "bigImage": png_base64(512, 192),
                "smallImage": png_base64(320, 50),
                "secretKey": secret_key,
                "uuid": "challenge-uuid-1",
            }
        })
    }

    fn script_happy_path(t: &Scripted) {
        t.push(AUTH_URL, 200, json!({"params": {"bussiness": "tok-1"}}));
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body("0123456789abcdef"));
        t.push(CAPTCHA_CHECK_URL, 200, json!({"code": 200, "params": {"sign": "sig-1"}}));
    }

    #[tokio::test]
    async fn test_refresh_installs_complete_set() {
        let t = Scripted::default();
        script_happy_path(&t);
        let mut n = negotiator(t, vec![five_rows()]);

        assert_eq!(*n.credentials(), CredentialSet::default());
        n.refresh().await.unwrap();

        let creds = n.credentials();
        assert_eq!(creds.token, "tok-1");
        assert_eq!(creds.sign, "sig-1");
        assert_eq!(creds.session_id, "challenge-uuid-1");
        assert!(creds.cookie.starts_with("__jsluid_s="));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        let t = Scripted::default();
        script_happy_path(&t);
        let mut n = negotiator(t.clone(), vec![five_rows()]);
        n.refresh().await.unwrap();
        let before = n.credentials().clone();

        // next negotiation fails at every step: token endpoint down
        for _ in 0..4 {
            t.push(AUTH_URL, 500, Value::Null);
        }
        assert!(matches!(n.refresh().await, Err(QueryError::Negotiation(_))));
        assert_eq!(*n.credentials(), before);
    }

    #[tokio::test]
    async fn test_recognition_failure_refetches_challenge_without_new_token() {
        let t = Scripted::default();
        t.push(AUTH_URL, 200, json!({"params": {"bussiness": "tok-1"}}));
        // first challenge yields 4 boxes (bad pass), second yields 5
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body("0123456789abcdef"));
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body("0123456789abcdef"));
        t.push(CAPTCHA_CHECK_URL, 200, json!({"code": 200, "params": {"sign": "sig-2"}}));

        let mut n = negotiator(t.clone(), vec![four_rows(), five_rows()]);
        n.refresh().await.unwrap();

        assert_eq!(t.requests_to(AUTH_URL).len(), 1, "token must not be re-acquired");
        assert_eq!(t.requests_to(CAPTCHA_IMAGE_URL).len(), 2);
        // each attempt used a fresh correlation id
        let uids: Vec<String> = t
            .requests_to(CAPTCHA_IMAGE_URL)
            .iter()
            .map(|b| b["clientUid"].as_str().unwrap().to_string())
            .collect();
        assert_ne!(uids[0], uids[1]);
        assert!(uids[0].starts_with("point-"));
    }

    #[tokio::test]
    async fn test_points_shifted_and_encrypted() {
        let key = "0123456789abcdef";
        let t = Scripted::default();
        t.push(AUTH_URL, 200, json!({"params": {"bussiness": "tok-1"}}));
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body(key));
        t.push(CAPTCHA_CHECK_URL, 200, json!({"code": 200, "params": {"sign": "s"}}));

        let mut n = negotiator(t.clone(), vec![five_rows()]);
        n.refresh().await.unwrap();

        let verify = &t.requests_to(CAPTCHA_CHECK_URL)[0];
        assert_eq!(verify["token"], "challenge-uuid-1");
        assert_eq!(verify["secretKey"], key);

        let decrypted =
            crate::crypto::aes_ecb_decrypt(verify["pointJson"].as_str().unwrap(), key).unwrap();
        let points: Vec<Value> = serde_json::from_slice(&decrypted).unwrap();
        assert_eq!(points.len(), 4);
        // AlwaysMatch picks the first box (left=30, top=70 in source space)
        // and every coordinate carries exactly the (+20, +20) bias
        assert_eq!(points[0]["x"], 30 + 20);
        assert_eq!(points[0]["y"], 70 + 20);
        // compact serialization, no whitespace
        let text = String::from_utf8(decrypted).unwrap();
        assert!(!text.contains(' '));
    }

    #[tokio::test]
    async fn test_verify_rejection_is_application_error() {
        let t = Scripted::default();
        t.push(AUTH_URL, 200, json!({"params": {"bussiness": "tok-1"}}));
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body("0123456789abcdef"));
        t.push(CAPTCHA_CHECK_URL, 200, json!({"code": 412, "msg": "点选坐标错误"}));
        // outer retry gets a second full pass
        t.push(AUTH_URL, 200, json!({"params": {"bussiness": "tok-2"}}));
        t.push(CAPTCHA_IMAGE_URL, 200, challenge_body("0123456789abcdef"));
        t.push(CAPTCHA_CHECK_URL, 200, json!({"code": 200, "params": {"sign": "ok"}}));

        let mut n = negotiator(t.clone(), vec![five_rows()]);
        n.refresh().await.unwrap();
        assert_eq!(n.credentials().token, "tok-2");
        assert_eq!(t.requests_to(AUTH_URL).len(), 2);
    }

    #[test]
    fn test_cookie_shape() {
        let cookie = synthesize_cookie();
        let value = cookie.strip_prefix("__jsluid_s=").expect("cookie prefix");
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cookie, synthesize_cookie());
    }

    #[test]
    fn test_empty_headers_before_first_refresh() {
        let solver = Solver::new(
            Box::new(StubDetector { row_sets: Arc::new(Mutex::new(vec![five_rows()])) }),
            Box::new(AlwaysMatch),
        );
        let n = Negotiator::new(Scripted::default(), solver);
        for (_, value) in n.headers() {
            assert!(value.is_empty());
        }
    }
}
