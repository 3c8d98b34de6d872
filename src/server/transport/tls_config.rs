//! TLS 证书加载（基于 rustls + ring）
//!
//! 读取服务端证书链、私钥和信任链，构建 rustls `ServerConfig`。
//! 信任链中的证书会附加在服务端证书链之后发送给客户端，不要求客户端证书。

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

use crate::error::{RatError, RatResult};
use crate::utils::crypto_provider::{ensure_crypto_provider_installed, ring_provider};
use crate::utils::logger::{debug, info};

/// 信任链文件：`(路径, 是否为 PEM)`，非 PEM 按 DER 读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaFile {
    pub path: PathBuf,
    pub is_pem: bool,
}

impl<P: Into<PathBuf>> From<(P, bool)> for CaFile {
    fn from((path, is_pem): (P, bool)) -> Self {
        Self { path: path.into(), is_pem }
    }
}

/// TLS 材料
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_files: Vec<CaFile>,
}

impl TlsMaterial {
    /// 校验文件是否存在，不解析内容
    pub fn validate(&self) -> RatResult<()> {
        for path in [&self.cert_path, &self.key_path]
            .into_iter()
            .chain(self.ca_files.iter().map(|ca| &ca.path))
        {
            if !path.is_file() {
                return Err(RatError::InvalidArgument(format!("文件不存在: {}", path.display())));
            }
        }
        Ok(())
    }

    /// 加载全部材料并构建 ServerConfig
    pub fn build_server_config(&self) -> RatResult<Arc<ServerConfig>> {
        ensure_crypto_provider_installed();

        let mut chain = load_pem_certs(&self.cert_path)?;
        if chain.is_empty() {
            return Err(RatError::TlsError(format!("证书文件中没有证书: {}", self.cert_path.display())));
        }
        let key = load_private_key(&self.key_path)?;

        for ca in &self.ca_files {
            let ca_certs = if ca.is_pem {
                load_pem_certs(&ca.path)?
            } else {
                vec![load_der_cert(&ca.path)?]
            };
            if ca_certs.is_empty() {
                return Err(RatError::TlsError(format!("CA 文件中没有证书: {}", ca.path.display())));
            }
            debug!("🔐 [TLS] 已加载信任链 {} ({} 个证书)", ca.path.display(), ca_certs.len());
            chain.extend(ca_certs);
        }

        let mut config = ServerConfig::builder_with_provider(ring_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!("🔐 [TLS] 证书加载完成: {}", self.cert_path.display());
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> RatResult<BufReader<File>> {
    let file = File::open(path).map_err(|e| RatError::TlsError(format!("打开文件 {} 失败: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_pem_certs(path: &Path) -> RatResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RatError::TlsError(format!("解析证书 {} 失败: {}", path.display(), e)))
}

fn load_der_cert(path: &Path) -> RatResult<CertificateDer<'static>> {
    let der = std::fs::read(path).map_err(|e| RatError::TlsError(format!("读取证书 {} 失败: {}", path.display(), e)))?;
    if der.is_empty() {
        return Err(RatError::TlsError(format!("证书文件为空: {}", path.display())));
    }
    Ok(CertificateDer::from(der))
}

fn load_private_key(path: &Path) -> RatResult<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    private_key(&mut reader)
        .map_err(|e| RatError::TlsError(format!("解析私钥 {} 失败: {}", path.display(), e)))?
        .ok_or_else(|| RatError::TlsError(format!("私钥文件为空: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        (cert_path, key_path, cert.serialize_der().unwrap())
    }

    #[test]
    fn test_build_with_pem_and_der_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path, der) = write_self_signed(dir.path());
        let der_path = dir.path().join("ca.der");
        std::fs::write(&der_path, der).unwrap();

        let material = TlsMaterial {
            cert_path: cert_path.clone(),
            key_path,
            ca_files: vec![(cert_path, true).into(), (der_path, false).into()],
        };
        assert!(material.validate().is_ok());
        let config = material.build_server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_files_rejected() {
        let material = TlsMaterial {
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
            ca_files: Vec::new(),
        };
        assert!(matches!(material.validate(), Err(RatError::InvalidArgument(_))));
        assert!(matches!(material.build_server_config(), Err(RatError::TlsError(_))));
    }

    #[test]
    fn test_garbage_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _key_path, _) = write_self_signed(dir.path());
        let bad_key = dir.path().join("bad.key");
        std::fs::write(&bad_key, "not a key").unwrap();

        let material = TlsMaterial {
            cert_path,
            key_path: bad_key,
            ca_files: Vec::new(),
        };
        assert!(matches!(material.build_server_config(), Err(RatError::TlsError(_))));
    }
}
