//! Randomized browser fingerprint headers. One version/platform combo is
//! chosen per request and every derived header agrees with it, so the
//! fingerprint is varied across requests but never self-contradictory.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{HOST, ORIGIN, REFERER};

const CHROME_VERSIONS: &[&str] = &["122", "123", "124"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
}

impl Platform {
    fn ua_fragment(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows NT 10.0; Win64; x64",
            Platform::MacOs => "Macintosh; Intel Mac OS X 10_15_7",
        }
    }

    fn client_hint(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows",
            Platform::MacOs => "macOS",
        }
    }
}

/// One internally consistent browser identity.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub version: &'static str,
    pub platform: Platform,
}

impl Fingerprint {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let version = CHROME_VERSIONS.choose(&mut rng).unwrap();
        let platform = if rng.gen_bool(0.5) { Platform::Windows } else { Platform::MacOs };
        Self { version, platform }
    }

    pub fn user_agent(&self) -> String {
        format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
            self.platform.ua_fragment(),
            self.version
        )
    }

    /// Full request header set for the query endpoints, before the
    /// credential headers are overlaid.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: String| {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(n, v);
            }
        };
        put("Host", HOST.to_string());
        put(
            "Sec-Ch-Ua",
            format!(
                "\"Chromium\";v=\"{v}\", \"Google Chrome\";v=\"{v}\", \"Not-A.Brand\";v=\"99\"",
                v = self.version
            ),
        );
        put("Sec-Ch-Ua-Mobile", "?0".to_string());
        put("Sec-Ch-Ua-Platform", format!("\"{}\"", self.platform.client_hint()));
        put("User-Agent", self.user_agent());
        put("Accept", "application/json, text/plain, */*".to_string());
        put("Content-Type", "application/json".to_string());
        put("Referer", REFERER.to_string());
        put("Origin", ORIGIN.to_string());
        headers
    }
}
