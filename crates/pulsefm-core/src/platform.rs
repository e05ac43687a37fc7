use std::path::PathBuf;

/// The voteId reserved for the fallback loop song and the bootstrap station.
pub const STUBBED_VOTE_ID: &str = "stubbed";

/// Singleton document key for the station record.
pub const STATION_DOC_ID: &str = "main";

/// Singleton document key for the current poll.
pub const POLL_DOC_ID: &str = "current";

/// `$XDG_CONFIG_HOME/pulsefm` (or the platform equivalent).
pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".config")
            .join("pulsefm")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulsefm")
    }
}

/// `$XDG_DATA_HOME/pulsefm` (or the platform equivalent) — used for any local
/// scratch state a given service keeps (none is durable; DS/KV own the truth).
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("pulsefm")
    }
    #[cfg(windows)]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulsefm")
    }
}
