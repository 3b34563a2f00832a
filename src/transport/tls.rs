//! rustls 客户端配置与握手。

use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring as ring_provider;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::config::types::TlsConfig;

use super::fingerprint::{self, FingerprintType};

/// 跳过证书验证的 verifier（仅用于 allow_insecure=true）
#[derive(Debug)]
pub struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// 构建 TLS ClientConfig。
///
/// 配置了指纹档位时替换密码套件顺序；`alpn_override` 用于
/// 传输层强制协议（如 SplitHTTP 的 h2）。
pub fn build_client_config(
    config: &TlsConfig,
    alpn_override: Option<&[&str]>,
) -> Result<ClientConfig> {
    let fp = config
        .fingerprint
        .as_deref()
        .map(FingerprintType::from_str)
        .unwrap_or(FingerprintType::None);

    let mut provider = ring_provider::default_provider();
    if let Some(suites) = fingerprint::cipher_suites(fp) {
        provider.cipher_suites = suites;
    }
    let provider = Arc::new(provider);

    let mut tls_config = if config.allow_insecure {
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    let alpn: Option<Vec<&str>> = match alpn_override {
        Some(protocols) => Some(protocols.to_vec()),
        None => config
            .alpn
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect()),
    };
    if let Some(protocols) = alpn {
        tls_config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    }

    Ok(tls_config)
}

/// 在一条 TCP 连接上完成 TLS 握手
pub async fn client_handshake(
    tcp: TcpStream,
    config: &TlsConfig,
    default_sni: &str,
    alpn_override: Option<&[&str]>,
) -> Result<TlsStream<TcpStream>> {
    let sni = config.sni.as_deref().unwrap_or(default_sni);
    let tls_config = build_client_config(config, alpn_override)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())?;
    let stream = connector.connect(server_name, tcp).await?;
    debug!(sni = sni, "TLS handshake completed");
    Ok(stream)
}
