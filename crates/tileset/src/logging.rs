use tracing_subscriber::EnvFilter;

use crate::TilesetError;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. A second call leaves the first subscriber in place and
/// returns an error the caller may ignore.
pub fn init_logging(default_filter: &str) -> Result<(), TilesetError> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(default_filter)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| TilesetError::Logging(err.to_string()))
}

#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing::level_filters::LevelFilter;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        let _ = init_logging("tileset=debug");
        let second = init_logging("tileset=debug");
        assert!(matches!(second, Err(TilesetError::Logging(_))));
    }
}
