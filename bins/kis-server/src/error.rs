#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config: {0}")]
    Config(#[from] kis_core::ConfigError),

    #[error("{0} is not enabled in the config")]
    Disabled(&'static str),

    #[error("{context} '{path}': {source}")]
    Io { context: &'static str, path: String, source: std::io::Error },

    #[error("archive store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("database: {0}")]
    Store(#[from] kis_core::StoreError),

    #[error("startup checks failed:\n{0}")]
    Startup(String),

    #[error("backfill: {0}")]
    Backfill(#[from] kis_core::BackfillError),

    #[error("api server: {0}")]
    Api(String),

    #[error("signal {signal}: {source}")]
    Signal { signal: &'static str, source: std::io::Error },
}

impl ServerError {
    pub fn signal(signal: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Signal { signal, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_error_names_the_signal() {
        let err = ServerError::signal("SIGUSR1")(std::io::Error::other("unsupported"));
        assert_eq!(err.to_string(), "signal SIGUSR1: unsupported");
    }
}
