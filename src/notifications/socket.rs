//! Push-notification channel
//!
//! Wraps the STOMP-over-websocket connection to the notification backend:
//! handshake, client heartbeats, the incoming frame loop and the frame
//! senders (subscribe, refresh). Incoming state pushes are delivered to the
//! state handler in arrival order; an unexpected close is reported to the
//! close handler so the session can reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::manager::TokenSource;
use crate::devices::models::{
    ControlState, FanSpeed, FanSwing, InteriorUnit, OperatingMode, Power, ScheduleType,
};
use crate::errors::{Error, Result};
use crate::notifications::frames;
use crate::notifications::stomp::{decode_server_frame, Frame, ServerFrame};
use crate::utils::timestamp_millis;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Invoked for every incoming state push. The boolean is true for partial
/// (single-bucket) updates, false for full-list pushes.
pub type StateHandler =
    Arc<dyn Fn(Vec<InteriorUnit>, bool) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once when the server closes the connection without the client
/// asking for it.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

struct Conn {
    sink: Arc<Mutex<WsSink>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    closed_by_client: Arc<AtomicBool>,
}

enum Inner {
    Disconnected,
    Open(Conn),
    Closing,
}

/// One logical connection to the notification backend. All methods are safe
/// to call concurrently; connection state lives behind a single lock.
pub struct NotificationSocket {
    url: String,
    token_source: Arc<dyn TokenSource>,
    user_id: i64,
    family_id: i64,
    heartbeat_interval: Duration,
    state: Mutex<Inner>,
    state_handler: std::sync::Mutex<Option<StateHandler>>,
    close_handler: std::sync::Mutex<Option<CloseHandler>>,
}

impl NotificationSocket {
    pub fn new(
        host: &str,
        token_source: Arc<dyn TokenSource>,
        user_id: i64,
        family_id: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        Self::with_url(
            &format!("wss://{}/rac-notifications/websocket", host),
            token_source,
            user_id,
            family_id,
            heartbeat_interval,
        )
    }

    /// Create a socket for an explicit endpoint URL (plain `ws://` allowed;
    /// used by tests against local stub servers).
    pub fn with_url(
        url: &str,
        token_source: Arc<dyn TokenSource>,
        user_id: i64,
        family_id: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            token_source,
            user_id,
            family_id,
            heartbeat_interval,
            state: Mutex::new(Inner::Disconnected),
            state_handler: std::sync::Mutex::new(None),
            close_handler: std::sync::Mutex::new(None),
        }
    }

    pub fn set_state_handler(&self, handler: StateHandler) {
        *self
            .state_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self
            .close_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, Inner::Open(_))
    }

    /// Open the websocket and perform the STOMP handshake. The connection
    /// lock is held for the whole attempt, so concurrent calls serialize and
    /// the second one fails with `IllegalState`.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, Inner::Disconnected) {
            return Err(Error::IllegalState(
                "notification channel is already connected".to_string(),
            ));
        }

        info!("Open websocket to {}", self.url);
        let token = self.token_source.token().await?;
        let (mut ws_stream, _) = connect_async(&self.url).await?;

        debug!("Send CONNECT stomp frame");
        let connect = frames::connect_frame(&token, self.heartbeat_interval.as_millis() as u64);
        ws_stream.send(Message::Text(connect.encode().into())).await?;

        debug!("Wait for CONNECTED frame");
        wait_for_connected(&mut ws_stream).await?;

        let (sink, stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed_by_client = Arc::new(AtomicBool::new(false));

        let tasks = vec![
            tokio::spawn(heartbeat_loop(
                sink.clone(),
                self.heartbeat_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(read_loop(
                self.clone(),
                stream,
                shutdown_rx,
                closed_by_client.clone(),
            )),
        ];

        *state = Inner::Open(Conn {
            sink,
            shutdown: shutdown_tx,
            tasks,
            closed_by_client,
        });
        Ok(())
    }

    /// Close the connection. Idempotent; a close initiated here never
    /// triggers the close handler.
    pub async fn close(&self) -> Result<()> {
        let conn = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, Inner::Closing) {
                Inner::Open(conn) => conn,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        conn.closed_by_client.store(true, Ordering::SeqCst);
        let _ = conn.shutdown.send(true);
        for task in conn.tasks {
            let _ = task.await;
        }
        if let Err(e) = conn.sink.lock().await.close().await {
            debug!("Websocket close handshake failed: {}", e);
        }

        *self.state.lock().await = Inner::Disconnected;
        info!("Websocket closed");
        Ok(())
    }

    /// Subscribe to the family notification topic. Returns the subscription
    /// id for a later [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(&self) -> Result<Uuid> {
        let subscription_id = Uuid::new_v4();
        info!(
            "Create subscription {} for user_id={} family_id={}",
            subscription_id, self.user_id, self.family_id
        );
        self.send_frame(frames::subscribe_frame(
            subscription_id,
            self.user_id,
            self.family_id,
        ))
        .await?;
        Ok(subscription_id)
    }

    pub async fn unsubscribe(&self, subscription_id: Uuid) -> Result<()> {
        info!("Remove subscription {}", subscription_id);
        self.send_frame(frames::unsubscribe_frame(subscription_id))
            .await
    }

    /// Ask the backend to push fresh state for one unit.
    pub async fn refresh(&self, rac_id: i64) -> Result<()> {
        info!("Request refresh rac_id={}", rac_id);
        let token = self.token_source.token().await?;
        self.send_frame(frames::refresh_frame(
            &token,
            self.user_id,
            self.family_id,
            rac_id,
        ))
        .await
    }

    /// Ask the backend to push fresh state for the whole family.
    pub async fn refresh_all(&self) -> Result<()> {
        info!("Request refresh all");
        let token = self.token_source.token().await?;
        self.send_frame(frames::refresh_all_frame(
            &token,
            self.user_id,
            self.family_id,
        ))
        .await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let sink = {
            let state = self.state.lock().await;
            match &*state {
                Inner::Open(conn) => conn.sink.clone(),
                _ => {
                    return Err(Error::IllegalState(
                        "notification channel is not connected".to_string(),
                    ))
                }
            }
        };
        sink.lock().await.send(Message::Text(frame.encode().into())).await?;
        Ok(())
    }

    /// Tear down an open connection without a close handshake. Returns true
    /// if a connection was actually open.
    async fn reset(&self) -> bool {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, Inner::Disconnected) {
            Inner::Open(conn) => {
                let _ = conn.shutdown.send(true);
                true
            }
            other => {
                *state = other;
                false
            }
        }
    }

    /// Process one websocket text message. Any error returned here is a
    /// protocol violation and fatal for the connection.
    async fn handle_text(&self, text: &str) -> Result<()> {
        let frame = match Frame::decode(text)? {
            None => {
                debug!("Received server heartbeat");
                return Ok(());
            }
            Some(frame) => frame,
        };

        match decode_server_frame(frame)? {
            ServerFrame::Message { body, .. } => {
                let body = body.ok_or_else(|| {
                    Error::Protocol("notification message without body".to_string())
                })?;
                let push: PushNotification = serde_json::from_value(body)
                    .map_err(|e| Error::Parse(format!("malformed notification body: {}", e)))?;

                let partial = match push.notification_type.as_str() {
                    "BUCKET_UPDATE" => true,
                    "ON_CONNECT" | "REFRESH_ALL" => false,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected notification type: {}",
                            other
                        )))
                    }
                };

                debug!(
                    "State push ({}) with {} units",
                    push.notification_type,
                    push.data.len()
                );
                let handler = self
                    .state_handler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(handler) = handler {
                    let units = push.data.into_iter().map(UnitPush::into_unit).collect();
                    // awaited here so pushes are applied in arrival order
                    handler(units, partial).await;
                }
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected frame after handshake: {:?}",
                other
            ))),
        }
    }

    fn on_unexpected_close(&self) {
        let handler = self
            .close_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Await the CONNECTED frame that answers our CONNECT.
async fn wait_for_connected(ws_stream: &mut WsStream) -> Result<()> {
    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Frame::decode(text.as_str())?.ok_or_else(|| {
                    Error::Protocol("got heartbeat while waiting for CONNECTED".to_string())
                })?;
                return match decode_server_frame(frame)? {
                    ServerFrame::Connected { version, .. } => {
                        debug!("STOMP handshake complete (version {})", version);
                        Ok(())
                    }
                    other => Err(Error::Protocol(format!(
                        "expected CONNECTED frame, got {:?}",
                        other
                    ))),
                };
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                return Err(Error::Protocol(
                    "unexpected binary frame during handshake".to_string(),
                ))
            }
            Some(Ok(_)) | None => {
                return Err(Error::ConnectionFailed(
                    "connection closed during STOMP handshake".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn heartbeat_loop(
    sink: Arc<Mutex<WsSink>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Start client heartbeat loop");
    loop {
        {
            debug!("Send client heartbeat");
            let mut sink = sink.lock().await;
            if let Err(e) = sink.send(Message::Text("\r\n".into())).await {
                warn!("Failed to send client heartbeat: {}", e);
                break;
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("End client heartbeat loop");
}

enum LoopEnd {
    Shutdown,
    Closed,
    Fatal,
}

async fn read_loop(
    socket: Arc<NotificationSocket>,
    mut stream: SplitStream<WsStream>,
    mut shutdown: watch::Receiver<bool>,
    closed_by_client: Arc<AtomicBool>,
) {
    debug!("Start incoming frame loop");
    let end = loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break LoopEnd::Shutdown,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = socket.handle_text(text.as_str()).await {
                    error!("Notification channel protocol violation: {}", e);
                    break LoopEnd::Fatal;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                error!("Unexpected binary frame on notification channel");
                break LoopEnd::Fatal;
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Server closed notification channel: {:?}", frame);
                break LoopEnd::Closed;
            }
            Some(Ok(_)) => {} // ping/pong, answered by the library
            Some(Err(e)) => {
                error!("Notification channel error: {}", e);
                break LoopEnd::Closed;
            }
            None => break LoopEnd::Closed,
        }
    };

    match end {
        LoopEnd::Shutdown => {}
        LoopEnd::Closed => {
            let was_open = socket.reset().await;
            if was_open && !closed_by_client.load(Ordering::SeqCst) {
                socket.on_unexpected_close();
            }
        }
        // a misbehaving server is not retried automatically
        LoopEnd::Fatal => {
            socket.reset().await;
        }
    }
    debug!("End incoming frame loop");
}

/// Wire shape of the notification message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushNotification {
    notification_type: String,
    #[serde(default)]
    data: Vec<UnitPush>,
}

/// Wire shape of one device in a state push. Differs from the REST list in
/// two names: `modelTypeId` (numeric `racTypeId` over REST) and the
/// all-lowercase `scheduletype`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitPush {
    id: i64,
    name: String,
    room_temperature: f64,
    relative_temperature: f64,
    #[serde(with = "timestamp_millis")]
    updated_at: chrono::DateTime<chrono::Utc>,
    online: bool,
    #[serde(with = "timestamp_millis")]
    last_online_updated_at: chrono::DateTime<chrono::Utc>,
    model: String,
    model_type_id: i64,
    serial_number: String,
    vendor_thing_id: String,
    #[serde(rename = "scheduletype")]
    schedule_type: ScheduleType,
    power: Power,
    mode: OperatingMode,
    idu_temperature: f64,
    humidity: i32,
    fan_speed: FanSpeed,
    fan_swing: FanSwing,
}

impl UnitPush {
    fn into_unit(self) -> InteriorUnit {
        InteriorUnit {
            id: self.id,
            name: self.name,
            room_temperature: self.room_temperature,
            relative_temperature: self.relative_temperature,
            updated_at: self.updated_at,
            online: self.online,
            online_updated_at: self.last_online_updated_at,
            model: self.model,
            model_type_id: self.model_type_id.to_string(),
            serial_number: self.serial_number,
            vendor_thing_id: self.vendor_thing_id,
            schedule_type: self.schedule_type,
            control: ControlState {
                rac_id: self.id,
                power: self.power,
                mode: self.mode,
                requested_temperature: self.idu_temperature,
                humidity: self.humidity,
                fan_speed: self.fan_speed,
                fan_swing: self.fan_swing,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> Result<String> {
            Ok("test-token".to_string())
        }
    }

    #[tokio::test]
    async fn test_operations_require_an_open_connection() {
        let socket = NotificationSocket::new(
            "notification.invalid",
            Arc::new(StaticToken),
            11,
            42,
            Duration::from_secs(10),
        );

        assert!(matches!(
            socket.subscribe().await,
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            socket.unsubscribe(Uuid::new_v4()).await,
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(socket.refresh(7).await, Err(Error::IllegalState(_))));
        assert!(matches!(
            socket.refresh_all().await,
            Err(Error::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_when_never_opened() {
        let socket = NotificationSocket::new(
            "notification.invalid",
            Arc::new(StaticToken),
            11,
            42,
            Duration::from_secs(10),
        );
        socket.close().await.unwrap();
        socket.close().await.unwrap();
        assert!(!socket.is_open().await);
    }

    fn push_unit_json(id: i64) -> serde_json::Value {
        json!({
            "id": id,
            "name": "Living room",
            "roomTemperature": 23.0,
            "relativeTemperature": 0.5,
            "updatedAt": 1_700_000_000_000i64,
            "online": true,
            "lastOnlineUpdatedAt": 1_700_000_000_000i64,
            "model": "RAC-70",
            "modelTypeId": 3,
            "serialNumber": "SN7",
            "vendorThingId": "VT7",
            "scheduletype": "SCHEDULE_DISABLED",
            "power": "ON",
            "mode": "COOLING",
            "iduTemperature": 24.0,
            "humidity": 126,
            "fanSpeed": "AUTO",
            "fanSwing": "OFF",
            // extra vendor fields are ignored
            "iduFrostWashStatus": {"active": false},
            "cloudId": "c7",
            "SysType": 1,
        })
    }

    #[test]
    fn test_push_body_decodes_with_push_wire_names() {
        let body = json!({
            "notificationType": "ON_CONNECT",
            "data": [push_unit_json(7)],
        });
        let push: PushNotification = serde_json::from_value(body).unwrap();
        assert_eq!(push.notification_type, "ON_CONNECT");

        let unit = push.data.into_iter().next().unwrap().into_unit();
        assert_eq!(unit.id, 7);
        assert_eq!(unit.model_type_id, "3");
        assert_eq!(unit.schedule_type, ScheduleType::ScheduleDisabled);
        assert_eq!(unit.control.requested_temperature, 24.0);
        assert_eq!(unit.control.humidity, 126);
    }

    #[test]
    fn test_push_body_without_data_defaults_to_empty() {
        let push: PushNotification =
            serde_json::from_value(json!({"notificationType": "REFRESH_ALL"})).unwrap();
        assert!(push.data.is_empty());
    }
}
