//! Browser fingerprint pool.
//!
//! Genuine TLS ClientHello impersonation (JA3/JA4 spoofing) has no maintained
//! Rust crate in this corpus; any plausible modern desktop-class TLS
//! fingerprint set is sufficient, so this approximates the anti-bot surface
//! at the HTTP header layer: UA, client hints, and a synthetic
//! `cf_clearance` cookie, randomly selected from a small pool of real, current
//! desktop Chrome releases.

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};

const CHROME_VERSIONS: &[&str] = &["124.0.6367.91", "125.0.6422.60", "126.0.6478.63", "127.0.6533.72"];

#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    pub chrome_version: &'static str,
    pub user_agent: String,
    pub sec_ch_ua: String,
    pub cf_clearance: String,
}

impl FingerprintProfile {
    /// Pick one of the pool's Chrome releases at random and build the matching
    /// UA, client-hint, and clearance-cookie triple.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let chrome_version = CHROME_VERSIONS[rng.gen_range(0..CHROME_VERSIONS.len())];
        let major = chrome_version.split('.').next().unwrap_or("124");

        let user_agent = format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/{chrome_version} Safari/537.36"
        );
        let sec_ch_ua = format!(
            "\"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\", \"Not.A/Brand\";v=\"24\""
        );
        let cf_clearance = synthetic_clearance_cookie(&mut rng);

        Self {
            chrome_version,
            user_agent,
            sec_ch_ua,
            cf_clearance,
        }
    }

    /// Headers to attach to every upstream request made under this profile.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_str(&self.user_agent).unwrap());
        headers.insert("sec-ch-ua", HeaderValue::from_str(&self.sec_ch_ua).unwrap());
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
        headers.insert(
            "cookie",
            HeaderValue::from_str(&format!("cf_clearance={}", self.cf_clearance)).unwrap(),
        );
        headers
    }
}

fn synthetic_clearance_cookie(rng: &mut impl Rng) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";
    (0..44)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_headers_are_internally_consistent() {
        let profile = FingerprintProfile::random();
        assert!(profile.user_agent.contains(profile.chrome_version));
        let headers = profile.header_map();
        assert!(headers.get("cookie").unwrap().to_str().unwrap().starts_with("cf_clearance="));
    }
}
