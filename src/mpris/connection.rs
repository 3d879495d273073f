//! D-Bus connection management and the MPRIS player proxy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use zbus::proxy;
use zvariant::OwnedValue;

/// Well-known name prefix shared by every MPRIS player.
pub const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2";
pub const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
pub const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Errors from the bus transport.
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("D-Bus error: {0}")]
    ZBus(#[from] zbus::Error),
    #[error("failed to establish a session bus connection")]
    NoConnection,
}

/// Shared session connection singleton.
static SESSION_CONNECTION: OnceCell<Arc<zbus::Connection>> = OnceCell::const_new();

/// Get or create the shared session bus connection.
pub async fn session_connection() -> Result<Arc<zbus::Connection>, BusError> {
    SESSION_CONNECTION
        .get_or_try_init(|| async {
            let conn = zbus::Connection::session()
                .await
                .map_err(|_| BusError::NoConnection)?;
            Ok(Arc::new(conn))
        })
        .await
        .cloned()
}

/// Proxy for the properties the relay reads directly from a player.
#[proxy(
    interface = "org.mpris.MediaPlayer2.Player",
    default_path = "/org/mpris/MediaPlayer2"
)]
pub trait MediaPlayer {
    #[zbus(property)]
    fn position(&self) -> zbus::Result<i64>;

    #[zbus(property)]
    fn metadata(&self) -> zbus::Result<HashMap<String, OwnedValue>>;

    #[zbus(property)]
    fn playback_status(&self) -> zbus::Result<String>;
}

/// Build an uncached proxy for a player bus name.
///
/// Caching is disabled so that `Position` reads always hit the player;
/// players do not signal position changes, so a cached value would go
/// stale immediately.
pub async fn player_proxy(
    conn: &zbus::Connection,
    bus_name: &str,
) -> Result<MediaPlayerProxy<'static>, BusError> {
    Ok(MediaPlayerProxy::builder(conn)
        .destination(bus_name.to_string())?
        .cache_properties(zbus::proxy::CacheProperties::No)
        .build()
        .await?)
}

/// True when the bus name belongs to an MPRIS player.
pub fn is_mpris_name(name: &str) -> bool {
    name.starts_with(MPRIS_PREFIX)
}

/// Strip the MPRIS prefix, yielding the stable short identifier.
pub fn short_name(bus_name: &str) -> &str {
    bus_name
        .strip_prefix(MPRIS_PREFIX)
        .map(|rest| rest.strip_prefix('.').unwrap_or(rest))
        .unwrap_or(bus_name)
}

/// True when the bus name contains any excluded substring
/// (case-insensitive).
pub fn is_excluded(bus_name: &str, excluded: &[String]) -> bool {
    let name_lower = bus_name.to_lowercase();
    excluded
        .iter()
        .any(|pattern| name_lower.contains(&pattern.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_strips_prefix() {
        assert_eq!(short_name("org.mpris.MediaPlayer2.spotify"), "spotify");
        assert_eq!(
            short_name("org.mpris.MediaPlayer2.firefox.instance123"),
            "firefox.instance123"
        );
        assert_eq!(short_name("org.other.Name"), "org.other.Name");
    }

    #[test]
    fn mpris_name_gate() {
        assert!(is_mpris_name("org.mpris.MediaPlayer2.vlc"));
        assert!(!is_mpris_name("org.freedesktop.Notifications"));
    }

    #[test]
    fn exclusion_is_case_insensitive_substring() {
        let excluded = vec!["playerctld".to_string()];
        assert!(is_excluded("org.mpris.MediaPlayer2.playerctld", &excluded));
        assert!(is_excluded("org.mpris.MediaPlayer2.PlayerCtlD", &excluded));
        assert!(!is_excluded("org.mpris.MediaPlayer2.spotify", &excluded));
    }
}
