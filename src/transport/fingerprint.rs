//! TLS ClientHello 指纹模拟。
//!
//! 通过调整 rustls 的密码套件顺序与 ALPN 逼近主流浏览器的
//! JA3 指纹。不是字节级的 utls，但足以改变被动指纹分类。

use rustls::SupportedCipherSuite;

/// 已知的浏览器指纹档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintType {
    Chrome,
    Firefox,
    Safari,
    Random,
    /// rustls 默认顺序，不做模拟
    None,
}

impl FingerprintType {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "chrome" | "edge" | "android" => Self::Chrome,
            "firefox" => Self::Firefox,
            "safari" | "ios" => Self::Safari,
            "random" | "randomized" => Self::Random,
            _ => Self::None,
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Chromium 系的套件顺序
fn chrome_cipher_suites() -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Firefox 把 ChaCha20 排得更靠前
fn firefox_cipher_suites() -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ]
}

fn safari_cipher_suites() -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

fn random_fingerprint() -> FingerprintType {
    let choices = [
        FingerprintType::Chrome,
        FingerprintType::Firefox,
        FingerprintType::Safari,
    ];
    choices[rand::random_range(0..choices.len())]
}

/// 指纹对应的套件顺序；None 表示用 rustls 默认
pub fn cipher_suites(fp: FingerprintType) -> Option<Vec<SupportedCipherSuite>> {
    match fp {
        FingerprintType::Chrome => Some(chrome_cipher_suites()),
        FingerprintType::Firefox => Some(firefox_cipher_suites()),
        FingerprintType::Safari => Some(safari_cipher_suites()),
        FingerprintType::Random => cipher_suites(random_fingerprint()),
        FingerprintType::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_aliases() {
        assert_eq!(FingerprintType::from_str("Chrome"), FingerprintType::Chrome);
        assert_eq!(FingerprintType::from_str("edge"), FingerprintType::Chrome);
        assert_eq!(FingerprintType::from_str("ios"), FingerprintType::Safari);
        assert_eq!(FingerprintType::from_str("firefox"), FingerprintType::Firefox);
        assert_eq!(FingerprintType::from_str("whatever"), FingerprintType::None);
        assert!(!FingerprintType::from_str("").is_some());
    }

    #[test]
    fn suites_for_known_profiles() {
        assert!(cipher_suites(FingerprintType::Chrome).is_some());
        assert!(cipher_suites(FingerprintType::Random).is_some());
        assert!(cipher_suites(FingerprintType::None).is_none());
    }

    #[test]
    fn chrome_and_firefox_differ() {
        let chrome = chrome_cipher_suites();
        let firefox = firefox_cipher_suites();
        assert_ne!(chrome[1], firefox[1]);
    }
}
