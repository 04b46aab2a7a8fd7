//! Session facade
//!
//! [`AirCloud`] ties the pieces together: REST client and token manager,
//! user profile, device store, command tracker and the push-notification
//! channel, including automatic reconnection of the latter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::http::RestClient;
use crate::api::iam::{self, TemperatureUnit, UserProfile};
use crate::api::rac::{self, CommandRef, CommandState, PowerAllResponse};
use crate::auth::manager::{AuthManager, TokenSource};
use crate::commands::tracker::{CommandTracker, StatusSource};
use crate::config::{Config, ReconnectOptions};
use crate::devices::models::{ControlState, ControlUpdate, InteriorUnit, Power};
use crate::devices::store::{ChangeListener, CommandDispatcher, DeviceStore};
use crate::errors::{Error, Result};
use crate::notifications::socket::NotificationSocket;
use crate::utils::backoff_delay;

/// Command status fetches go through the shared auth manager so the poll
/// loop survives token expiry.
struct RestStatusSource {
    rest: Arc<RestClient>,
    auth: Arc<AuthManager>,
}

#[async_trait]
impl StatusSource for RestStatusSource {
    async fn fetch(&self, commands: &[CommandRef]) -> Result<HashMap<String, CommandState>> {
        let token = self.auth.token().await?;
        rac::get_commands_state(&self.rest, &token, commands).await
    }
}

/// Full command path: REST submission, acknowledgement wait, then a refresh
/// request so the confirmed state comes back over the push channel.
struct CommandPipeline {
    rest: Arc<RestClient>,
    auth: Arc<AuthManager>,
    tracker: CommandTracker,
    socket: Arc<NotificationSocket>,
    family_id: i64,
    ack_timeout: Duration,
}

#[async_trait]
impl CommandDispatcher for CommandPipeline {
    async fn send_and_wait_ack(&self, control: &ControlState) -> Result<()> {
        let token = self.auth.token().await?;
        let command = rac::send_command(&self.rest, &token, self.family_id, control).await?;

        let state = self.tracker.wait_ack(command, self.ack_timeout).await?;
        if !state.is_done() {
            return Err(Error::CommandFailed(format!(
                "unit {} did not acknowledge within {:?} (last state {:?})",
                control.rac_id, self.ack_timeout, state
            )));
        }

        // best effort; the state push will arrive eventually anyway
        if let Err(e) = self.socket.refresh(control.rac_id).await {
            warn!("Refresh request after command failed: {}", e);
        }
        Ok(())
    }
}

struct Connection {
    rest: Arc<RestClient>,
    auth: Arc<AuthManager>,
    profile: UserProfile,
    socket: Arc<NotificationSocket>,
    store: DeviceStore,
    /// Current subscription id; replaced by the reconnect loop after a
    /// re-subscription, so close() always unsubscribes the live one.
    subscription: Arc<std::sync::Mutex<Uuid>>,
}

/// Client session for one AirCloud account.
pub struct AirCloud {
    config: Config,
    email: String,
    password: SecretString,
    state: Mutex<Option<Connection>>,
    on_change: Arc<std::sync::Mutex<Option<ChangeListener>>>,
}

impl AirCloud {
    pub fn new(email: &str, password: &str) -> Self {
        Self::with_config(Config::default(), email, password)
    }

    pub fn with_config(config: Config, email: &str, password: &str) -> Self {
        Self {
            config,
            email: email.to_string(),
            password: SecretString::from(password),
            state: Mutex::new(None),
            on_change: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Replace the change listener. May be called before or after
    /// [`connect`](Self::connect); survives reconnects.
    pub fn set_change_listener(&self, listener: ChangeListener) {
        *self
            .on_change
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Sign in, fetch the device list and open the push channel.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(Error::IllegalState(
                "session is already connected".to_string(),
            ));
        }

        let rest = Arc::new(RestClient::new(&self.config.api_host, self.config.api_port)?);
        let auth = Arc::new(AuthManager::new(
            rest.clone(),
            self.email.clone(),
            self.password.clone(),
        ));
        let token = auth.token().await?;
        let profile = iam::fetch_profile(&rest, &token).await?;
        info!(
            "Signed in as user {} (family {})",
            profile.id, profile.family_id
        );

        let tracker = CommandTracker::new(
            Arc::new(RestStatusSource {
                rest: rest.clone(),
                auth: auth.clone(),
            }),
            self.config.command_poll_interval,
        );
        let socket = Arc::new(NotificationSocket::new(
            &self.config.notification_host,
            auth.clone(),
            profile.id,
            profile.family_id,
            self.config.heartbeat_interval,
        ));
        let store = DeviceStore::new(Arc::new(CommandPipeline {
            rest: rest.clone(),
            auth: auth.clone(),
            tracker,
            socket: socket.clone(),
            family_id: profile.family_id,
            ack_timeout: self.config.ack_timeout,
        }));

        // fan store changes out to the session listener
        let on_change = self.on_change.clone();
        store.set_change_listener(Box::new(move |change_set| {
            let listener = on_change.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(listener) = listener.as_ref() {
                listener(change_set);
            }
        }));

        // state pushes land in the store, in arrival order
        let push_store = store.clone();
        socket.set_state_handler(Arc::new(move |units, partial| {
            let store = push_store.clone();
            async move { store.apply_update(units, partial).await }.boxed()
        }));

        // an unexpected close kicks off background reconnection
        let subscription = Arc::new(std::sync::Mutex::new(Uuid::nil()));
        let weak = Arc::downgrade(&socket);
        let reconnect = self.config.reconnect.clone();
        let reconnect_subscription = subscription.clone();
        socket.set_close_handler(Arc::new(move || {
            let Some(socket) = weak.upgrade() else { return };
            tokio::spawn(reconnect_loop(
                socket,
                reconnect.clone(),
                reconnect_subscription.clone(),
            ));
        }));

        let units = rac::get_interior_units(&rest, &token, profile.family_id).await?;
        store.apply_update(units, false).await;

        socket.connect().await?;
        match socket.subscribe().await {
            Ok(id) => *subscription.lock().unwrap_or_else(|e| e.into_inner()) = id,
            Err(e) => {
                let _ = socket.close().await;
                return Err(e);
            }
        }

        *state = Some(Connection {
            rest,
            auth,
            profile,
            socket,
            store,
            subscription,
        });
        info!("Connected");
        Ok(())
    }

    /// Close the session. Idempotent; device state is dropped.
    pub async fn close(&self) -> Result<()> {
        let Some(connection) = self.state.lock().await.take() else {
            return Ok(());
        };
        let subscription = *connection
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Err(e) = connection.socket.unsubscribe(subscription).await {
            debug!("Unsubscribe before close failed: {}", e);
        }
        connection.socket.close().await?;
        info!("Session closed");
        Ok(())
    }

    /// Snapshot of every known interior unit. Empty when not connected.
    pub async fn interior_units(&self) -> Vec<InteriorUnit> {
        match self.state.lock().await.as_ref() {
            Some(connection) => connection.store.units().await,
            None => Vec::new(),
        }
    }

    pub async fn find_interior_unit(&self, rac_id: i64) -> Option<InteriorUnit> {
        match self.state.lock().await.as_ref() {
            Some(connection) => connection.store.find(rac_id).await,
            None => None,
        }
    }

    pub async fn get_interior_unit(&self, rac_id: i64) -> Result<InteriorUnit> {
        self.find_interior_unit(rac_id)
            .await
            .ok_or(Error::DeviceNotFound(rac_id))
    }

    /// Temperature unit configured on the account.
    pub async fn temperature_unit(&self) -> Result<TemperatureUnit> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        Ok(connection.profile.temperature_unit())
    }

    /// Queue a partial control change for one unit. Returns once the change
    /// is recorded; delivery and acknowledgement happen in the background,
    /// possibly coalesced with later changes to the same unit.
    pub async fn send_command(&self, rac_id: i64, update: ControlUpdate) -> Result<()> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        connection.store.send_command(rac_id, update).await
    }

    /// Re-fetch the full device list over REST and reconcile the store.
    pub async fn update_all(&self) -> Result<()> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        let token = connection.auth.token().await?;
        let units =
            rac::get_interior_units(&connection.rest, &token, connection.profile.family_id)
                .await?;
        connection.store.apply_update(units, false).await;
        Ok(())
    }

    /// Ask the backend to push fresh state for one unit.
    pub async fn request_update(&self, rac_id: i64) -> Result<()> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        connection.socket.refresh(rac_id).await
    }

    /// Ask the backend to push fresh state for every unit.
    pub async fn request_update_all(&self) -> Result<()> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        connection.socket.refresh_all().await
    }

    /// Switch every online unit on or off in one bulk request.
    pub async fn set_power_all(&self, power: Power) -> Result<PowerAllResponse> {
        let state = self.state.lock().await;
        let connection = state.as_ref().ok_or_else(not_connected)?;
        let token = connection.auth.token().await?;
        let controls: Vec<ControlState> = connection
            .store
            .units()
            .await
            .into_iter()
            .filter(|unit| unit.online)
            .map(|unit| unit.control)
            .collect();
        rac::set_power_all(
            &connection.rest,
            &token,
            connection.profile.family_id,
            power,
            &controls,
        )
        .await
    }
}

fn not_connected() -> Error {
    Error::IllegalState("session is not connected".to_string())
}

/// Re-establish the push channel with exponential backoff after an
/// unexpected close. A successful re-subscription replaces the session's
/// stored subscription id.
async fn reconnect_loop(
    socket: Arc<NotificationSocket>,
    options: ReconnectOptions,
    subscription: Arc<std::sync::Mutex<Uuid>>,
) {
    for attempt in 0..options.max_attempts {
        let delay = backoff_delay(&options.backoff, attempt);
        warn!(
            "Notification channel lost, reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt + 1,
            options.max_attempts
        );
        tokio::time::sleep(delay).await;

        match socket.connect().await {
            Ok(()) => match socket.subscribe().await {
                Ok(id) => {
                    *subscription.lock().unwrap_or_else(|e| e.into_inner()) = id;
                    info!("Notification channel re-established");
                    return;
                }
                Err(e) => warn!("Re-subscription failed: {}", e),
            },
            // someone else already reconnected or the session is closing
            Err(Error::IllegalState(_)) => return,
            Err(e) => warn!("Reconnect attempt failed: {}", e),
        }
    }
    error!(
        "Giving up on the notification channel after {} attempts",
        options.max_attempts
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use crate::notifications::stomp::Frame;
    use crate::utils::BackoffOptions;

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> Result<String> {
            Ok("test-token".to_string())
        }
    }

    /// STOMP-over-websocket stub: answers CONNECT with CONNECTED and records
    /// every SUBSCRIBE id. The first connection is dropped right after its
    /// first SUBSCRIBE; later connections stay open.
    async fn start_stub_endpoint(subscriptions: mpsc::UnboundedSender<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!(
            "ws://{}/rac-notifications/websocket",
            listener.local_addr().unwrap()
        );
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let drop_after_subscribe = std::mem::replace(&mut first, false);
                let subscriptions = subscriptions.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Text(text) = message else { continue };
                        let Ok(Some(frame)) = Frame::decode(text.as_str()) else {
                            continue;
                        };
                        match frame.command.as_str() {
                            "CONNECT" => {
                                let connected = Frame::new(
                                    "CONNECTED",
                                    vec![("version".to_string(), "1.1".to_string())],
                                    None,
                                );
                                if ws
                                    .send(Message::Text(connected.encode().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            "SUBSCRIBE" => {
                                if let Some(id) = frame.header("id") {
                                    let _ = subscriptions.send(id.to_string());
                                }
                                if drop_after_subscribe {
                                    // drops the socket without a close frame
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        url
    }

    #[tokio::test]
    async fn test_reconnect_replaces_the_stored_subscription_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = start_stub_endpoint(tx).await;

        let socket = Arc::new(NotificationSocket::with_url(
            &url,
            Arc::new(StaticToken),
            11,
            42,
            Duration::from_secs(10),
        ));

        let subscription = Arc::new(std::sync::Mutex::new(Uuid::nil()));
        socket.connect().await.unwrap();
        let first = socket.subscribe().await.unwrap();
        *subscription.lock().unwrap() = first;
        assert_eq!(rx.recv().await.unwrap(), first.to_string());

        // the stub drops the connection after the first subscribe
        tokio::time::timeout(Duration::from_secs(5), async {
            while socket.is_open().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket never noticed the dropped connection");

        reconnect_loop(
            socket.clone(),
            ReconnectOptions {
                backoff: BackoffOptions {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(10),
                    multiplier: 2.0,
                },
                max_attempts: 5,
            },
            subscription.clone(),
        )
        .await;
        assert!(socket.is_open().await);

        // the session now holds the re-established subscription, not the
        // original one
        let second = rx.recv().await.unwrap();
        let stored = *subscription.lock().unwrap();
        assert_eq!(stored.to_string(), second);
        assert_ne!(stored, first);

        socket.close().await.unwrap();
    }
}
