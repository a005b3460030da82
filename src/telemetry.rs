use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber honouring `RUST_LOG`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "vault_core=info".into()),
        )
        .try_init();
}
