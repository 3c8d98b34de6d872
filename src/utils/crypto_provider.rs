use std::sync::{Arc, Once};

use rustls::crypto::CryptoProvider;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 确保 ring CryptoProvider 只安装一次
///
/// 这个函数使用 std::sync::Once 确保无论被调用多少次，
/// 进程级默认 provider 的安装只会执行一次
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // 其他组件可能已经安装过 provider，这种情况下忽略错误
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            crate::utils::logger::debug!("🔐 CryptoProvider 已由其他组件安装");
        } else {
            crate::utils::logger::debug!("🔐 ring CryptoProvider 已安装");
        }
    });
}

/// 获取 ring provider，构建 ServerConfig 时显式使用，避免依赖进程默认值
pub fn ring_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
