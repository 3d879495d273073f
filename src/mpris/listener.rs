//! Bus listener: player discovery, lifecycle tracking, and the
//! active-player arbiter.
//!
//! One signal task per player watches its `PropertiesChanged` and `Seeked`
//! streams; a single dispatcher task funnels player emissions to the
//! socket server and detects active-player identity changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::stream::{StreamExt, select_all};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::{MatchRule, MessageStream, fdo};
use zvariant::OwnedValue;

use crate::events::{EventClass, PlayerEvent};
use crate::metadata::Metadata;
use crate::mpris::connection::{
    self, BusError, MPRIS_PATH, PLAYER_INTERFACE, PROPERTIES_INTERFACE,
};
use crate::mpris::player::Player;
use crate::server::SocketServer;
use crate::transform::TransformEngine;

struct PlayerHandle {
    player: Arc<Player>,
    signal_task: JoinHandle<()>,
}

pub struct BusListener {
    conn: zbus::Connection,
    server: Arc<SocketServer>,
    engine: Arc<StdMutex<TransformEngine>>,
    excluded: Vec<String>,
    events_tx: mpsc::Sender<PlayerEvent>,
    players: Mutex<HashMap<String, PlayerHandle>>,
    last_active_identity: Mutex<Option<String>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl BusListener {
    pub fn new(
        conn: zbus::Connection,
        server: Arc<SocketServer>,
        engine: Arc<StdMutex<TransformEngine>>,
        excluded: Vec<String>,
    ) -> (Arc<Self>, mpsc::Receiver<PlayerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let listener = Arc::new(Self {
            conn,
            server,
            engine,
            excluded,
            events_tx,
            players: Mutex::new(HashMap::new()),
            last_active_identity: Mutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        });
        (listener, events_rx)
    }

    /// Forward player emissions to the server, firing `ON_PLAYER` whenever
    /// the arbiter's selection changes.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut events_rx: mpsc::Receiver<PlayerEvent>) {
        let listener = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                debug!(
                    player = event.player.as_str(),
                    class = event.class.as_str(),
                    "forwarding player event"
                );
                listener
                    .server
                    .send_metadata(event.class, &event.metadata)
                    .await;
                listener.check_active_change().await;
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    /// Subscribe to `NameOwnerChanged` so players are registered and
    /// dropped as they come and go.
    pub async fn watch_name_owners(self: &Arc<Self>) -> Result<(), BusError> {
        let proxy = fdo::DBusProxy::new(&self.conn)
            .await
            .map_err(zbus::Error::from)?;
        let mut stream = proxy
            .receive_name_owner_changed()
            .await
            .map_err(zbus::Error::from)?;
        let listener = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let name = args.name().to_string();
                let has_owner = args.new_owner().is_some();
                listener.handle_name_owner_changed(&name, has_owner).await;
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
        Ok(())
    }

    /// Register players that were already on the bus at startup.
    pub async fn discover_existing(&self) -> Result<(), BusError> {
        let proxy = fdo::DBusProxy::new(&self.conn)
            .await
            .map_err(zbus::Error::from)?;
        let names = proxy.list_names().await.map_err(zbus::Error::from)?;
        let mpris_names: Vec<String> = names
            .iter()
            .map(|n| n.to_string())
            .filter(|n| connection::is_mpris_name(n) && !connection::is_excluded(n, &self.excluded))
            .collect();
        if !mpris_names.is_empty() {
            info!(players = ?mpris_names, "found existing media players");
        }
        for name in mpris_names {
            if let Err(err) = self.connect_player(&name, true).await {
                warn!(player = name.as_str(), error = %err, "failed to connect existing player");
            }
        }
        Ok(())
    }

    pub async fn handle_name_owner_changed(&self, bus_name: &str, has_owner: bool) {
        if !connection::is_mpris_name(bus_name)
            || connection::is_excluded(bus_name, &self.excluded)
        {
            return;
        }
        if has_owner {
            if let Err(err) = self.connect_player(bus_name, false).await {
                warn!(player = bus_name, error = %err, "failed to set up player");
            }
        } else {
            let short = connection::short_name(bus_name).to_string();
            self.disconnect_player(&short).await;
            // Tell every subscriber what is now playing, which is either
            // another player's metadata or the empty dictionary.
            let metadata = self.active_metadata().await;
            for class in [
                EventClass::Event,
                EventClass::Seek,
                EventClass::Metadata,
                EventClass::Status,
            ] {
                self.server.send_metadata(class, &metadata).await;
            }
            self.check_active_change().await;
        }
    }

    async fn connect_player(&self, bus_name: &str, existing: bool) -> Result<(), BusError> {
        let short = connection::short_name(bus_name).to_string();
        info!(player = short.as_str(), "player connected, setting up listener");

        let proxy = connection::player_proxy(&self.conn, bus_name).await?;
        let player = Arc::new(Player::new(
            short.clone(),
            proxy,
            Arc::clone(&self.engine),
            self.events_tx.clone(),
        ));

        let properties_rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(bus_name)?
            .path(MPRIS_PATH)?
            .interface(PROPERTIES_INTERFACE)?
            .member("PropertiesChanged")?
            .build();
        let seeked_rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(bus_name)?
            .path(MPRIS_PATH)?
            .interface(PLAYER_INTERFACE)?
            .member("Seeked")?
            .build();
        let streams = vec![
            MessageStream::for_match_rule(properties_rule, &self.conn, Some(8)).await?,
            MessageStream::for_match_rule(seeked_rule, &self.conn, Some(8)).await?,
        ];

        let signal_player = Arc::clone(&player);
        let signal_task = tokio::spawn(async move {
            let mut stream = select_all(streams);
            while let Some(result) = stream.next().await {
                let Ok(msg) = result else {
                    continue;
                };
                let member = msg.header().member().map(|m| m.as_str().to_string());
                match member.as_deref() {
                    Some("Seeked") => {
                        if let Ok((position,)) = msg.body().deserialize::<(i64,)>()
                            && let Err(err) = signal_player.on_seek(position).await
                        {
                            warn!(
                                player = signal_player.name(),
                                error = %err,
                                "seek handling failed"
                            );
                        }
                    }
                    Some("PropertiesChanged") => {
                        let parsed = msg
                            .body()
                            .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>();
                        if let Ok((interface, changed, _invalidated)) = parsed
                            && interface == PLAYER_INTERFACE
                        {
                            signal_player.on_properties_changed(changed).await;
                        }
                    }
                    _ => {}
                }
            }
        });

        if existing {
            // Discovery-time path: populate state from the player's
            // current properties.
            if let Err(err) = player.force_update().await {
                warn!(player = short.as_str(), error = %err, "initial state pull failed");
            }
            if let Err(err) = player.on_seek(1).await {
                warn!(player = short.as_str(), error = %err, "initial seek anchor failed");
            }
        }

        let mut players = self.players.lock().await;
        if let Some(previous) = players.insert(short, PlayerHandle { player, signal_task }) {
            previous.signal_task.abort();
        }
        Ok(())
    }

    pub async fn disconnect_player(&self, short_name: &str) {
        let removed = self.players.lock().await.remove(short_name);
        if let Some(handle) = removed {
            info!(player = short_name, "player disconnected, removing its entry");
            handle.signal_task.abort();
        }
    }

    pub async fn disconnect_all(&self) {
        let mut players = self.players.lock().await;
        for (_, handle) in players.drain() {
            handle.signal_task.abort();
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }

    /// The arbiter: playing players first, then most recently active.
    pub async fn active_player(&self) -> Option<Arc<Player>> {
        let players = self.players.lock().await;
        let mut candidates = Vec::with_capacity(players.len());
        for handle in players.values() {
            let (active, last_active) = handle.player.activity().await;
            candidates.push((active, last_active, Arc::clone(&handle.player)));
        }
        let index = select_active(
            &candidates
                .iter()
                .map(|(active, last_active, _)| (*active, *last_active))
                .collect::<Vec<_>>(),
        )?;
        Some(Arc::clone(&candidates[index].2))
    }

    /// The active player's normalized metadata with tracking fields, or
    /// the empty dictionary when no player is registered.
    pub async fn active_metadata(&self) -> Metadata {
        match self.active_player().await {
            Some(player) => player.metadata_with_tracking().await,
            None => Metadata::new(),
        }
    }

    /// Emit `ON_PLAYER` when the arbiter's selected identity changed.
    async fn check_active_change(&self) {
        let current = match self.active_player().await {
            Some(player) => Some(player.name().to_string()),
            None => None,
        };
        let mut last = self.last_active_identity.lock().await;
        if *last != current {
            debug!(active = ?current, "active player changed");
            *last = current;
            drop(last);
            let metadata = self.active_metadata().await;
            self.server
                .send_metadata(EventClass::Player, &metadata)
                .await;
        }
    }
}

/// Pick the winning candidate by `(playing, last_active)`, ties keeping
/// the earliest entry.
fn select_active(candidates: &[(bool, f64)]) -> Option<usize> {
    let mut best: Option<(usize, (bool, f64))> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        match &best {
            Some((_, best_key)) if *candidate <= *best_key => {}
            _ => best = Some((index, *candidate)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::select_active;

    #[test]
    fn playing_player_wins_over_more_recent_stopped_one() {
        // A stopped recently, B is playing: B is the active player.
        let candidates = vec![(false, 100.0), (true, 10.0)];
        assert_eq!(select_active(&candidates), Some(1));
    }

    #[test]
    fn most_recently_active_wins_when_nothing_is_playing() {
        let candidates = vec![(false, 5.0), (false, 50.0), (false, 20.0)];
        assert_eq!(select_active(&candidates), Some(1));
    }

    #[test]
    fn ties_keep_the_earliest_entry() {
        let candidates = vec![(true, 7.0), (true, 7.0)];
        assert_eq!(select_active(&candidates), Some(0));
    }

    #[test]
    fn empty_registry_selects_nobody() {
        assert_eq!(select_active(&[]), None);
    }
}
