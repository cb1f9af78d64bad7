use tracing::debug;

/// Installs the process-wide rustls provider shared by the kube and admin API clients.
pub fn init_crypto() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider was already installed");
    }
}
