use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, Mutex, Notify},
};
use tracing::{debug, info, warn};

use launcher_common::{
    parse_switch_payload, protocol::MAX_DATAGRAM_LEN, switch_payload, ButtonDebouncer,
    ButtonEdge, ButtonIntent, CommandDispatcher, DeviceIdentity, Error, HardwareAddress,
    IntentOutcome, ProvisioningEndpoint, RuntimeConfig, TargetStore, PAYLOAD_OFFLINE,
    PAYLOAD_ONLINE, SETUP_ID, TOPIC_STATUS, TOPIC_SWITCH_SET, TOPIC_SWITCH_STATE,
};

use crate::{net::UdpBroadcaster, store::FileTargetStore};

type Dispatcher = CommandDispatcher<Arc<FileTargetStore>, UdpBroadcaster>;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Mutex<Dispatcher>>,
    provisioning: Arc<ProvisioningEndpoint<Arc<FileTargetStore>>>,
    buttons: mpsc::Sender<ButtonEdge>,
    restart: Arc<Notify>,
    mqtt: AsyncClient,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    online: bool,
    #[serde(rename = "targetConfigured")]
    target_configured: bool,
    #[serde(rename = "targetMac")]
    target_mac: Option<String>,
    #[serde(rename = "setupCode")]
    setup_code: String,
    #[serde(rename = "setupId")]
    setup_id: &'static str,
}

#[derive(Debug, Deserialize)]
struct SwitchUpdate {
    on: bool,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const BUTTON_QUEUE_DEPTH: usize = 16;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let identity = DeviceIdentity::new(device_mac()?);
    info!(
        "device {} setup code {} (setup id {SETUP_ID}), provisioning service `{}` pop `{}`",
        identity.mac,
        identity.setup_code.formatted(),
        identity.service_name(),
        identity.proof_of_possession(),
    );

    let target_store = Arc::new(store.target_store());
    match target_store.get() {
        Ok(record) => match record.target() {
            Some(target) => info!("target host {target}"),
            None => info!("no target host configured; waiting for provisioning"),
        },
        Err(err) => warn!("target store unreadable: {err}"),
    }

    let transport = UdpBroadcaster::bind(runtime.network.broadcast_addr)
        .context("failed to open broadcast socket")?;
    info!("commands broadcast to {}", transport.broadcast_addr());

    let dispatcher = CommandDispatcher::new(target_store.clone(), transport, &runtime);
    let provisioning = ProvisioningEndpoint::new(target_store, identity);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("launcher-controller-rust", mqtt_host, mqtt_port);
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_STATUS,
        PAYLOAD_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let heartbeat_addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.heartbeat_port));
    let heartbeat_socket = UdpSocket::bind(heartbeat_addr)
        .await
        .with_context(|| format!("failed to bind heartbeat listener at {heartbeat_addr}"))?;

    let (buttons, button_edges) = mpsc::channel(BUTTON_QUEUE_DEPTH);
    let restart = Arc::new(Notify::new());

    let app_state = AppState {
        dispatcher: Arc::new(Mutex::new(dispatcher)),
        provisioning: Arc::new(provisioning),
        buttons,
        restart: restart.clone(),
        mqtt,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_heartbeat_listener(app_state.clone(), heartbeat_socket);
    spawn_presence_loop(
        app_state.clone(),
        Duration::from_millis(runtime.presence.poll_interval_ms),
    );
    spawn_button_task(
        app_state.clone(),
        button_edges,
        ButtonDebouncer::from_config(&runtime.button),
    );

    let app = Router::new()
        .route("/prov/targetMAC", post(handle_provision))
        .route("/api/status", get(handle_get_status))
        .route("/api/switch", put(handle_put_switch))
        .route("/api/button/tap", post(handle_button_tap))
        .route("/api/button/long-press", post(handle_button_long_press))
        .with_state(app_state);

    let port = std::env::var("LAUNCHER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_stop(restart))
        .await?;
    info!("controller stopped");
    Ok(())
}

fn device_mac() -> anyhow::Result<HardwareAddress> {
    if let Ok(value) = std::env::var("LAUNCHER_DEVICE_MAC") {
        return value
            .parse()
            .with_context(|| format!("invalid LAUNCHER_DEVICE_MAC `{value}`"));
    }

    match mac_address::get_mac_address() {
        Ok(Some(mac)) => Ok(HardwareAddress::new(mac.bytes())),
        Ok(None) => {
            warn!("no interface with a hardware address; deriving identity from 00:00:00:00:00:00");
            Ok(HardwareAddress::default())
        }
        Err(err) => Err(err).context("failed to read host hardware address"),
    }
}

async fn wait_for_stop(restart: Arc<Notify>) {
    tokio::select! {
        _ = restart.notified() => info!("factory reset complete; exiting for restart"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = announce(&app_state).await {
                        warn!("mqtt announce failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

// Runs inside the event loop task, so requests are queued without waiting.
async fn announce(app_state: &AppState) -> anyhow::Result<()> {
    let online = app_state.dispatcher.lock().await.presence().last_reported();

    app_state
        .mqtt
        .try_subscribe(TOPIC_SWITCH_SET, QoS::AtLeastOnce)?;
    app_state
        .mqtt
        .try_publish(TOPIC_STATUS, QoS::AtLeastOnce, true, PAYLOAD_ONLINE)?;
    app_state.mqtt.try_publish(
        TOPIC_SWITCH_STATE,
        QoS::AtLeastOnce,
        true,
        switch_payload(online),
    )?;
    Ok(())
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }
    if topic != TOPIC_SWITCH_SET {
        return Ok(());
    }

    let Some(on) = parse_switch_payload(payload) else {
        warn!(
            "ignoring switch payload `{}`",
            String::from_utf8_lossy(payload)
        );
        return Ok(());
    };

    apply_switch_write(&app_state.dispatcher, on)
        .await
        .context("switch write failed")?;
    Ok(())
}

async fn apply_switch_write(
    dispatcher: &Mutex<Dispatcher>,
    on: bool,
) -> launcher_common::Result<Option<HardwareAddress>> {
    let result = dispatcher.lock().await.switch_write(on, monotonic_ms());
    match &result {
        Ok(Some(target)) => info!("switch {}: command sent to {target}", switch_payload(on)),
        Ok(None) => info!("switch {} ignored: no target configured", switch_payload(on)),
        Err(err) => warn!("switch {} failed: {err}", switch_payload(on)),
    }
    result
}

fn spawn_heartbeat_listener(app_state: AppState, socket: UdpSocket) {
    tokio::spawn(async move {
        let mut buf = [0_u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("heartbeat receive failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let result = {
                let mut dispatcher = app_state.dispatcher.lock().await;
                dispatcher.heartbeat_datagram(&buf[..len], monotonic_ms())
            };
            match result {
                Ok(true) => debug!("heartbeat from {peer}"),
                Ok(false) => {}
                Err(err) => warn!("heartbeat from {peer} dropped: {err}"),
            }
        }
    });
}

fn spawn_presence_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let flipped = {
                let mut dispatcher = app_state.dispatcher.lock().await;
                dispatcher.poll_online(monotonic_ms())
            };
            let Some(online) = flipped else {
                continue;
            };

            info!(
                "target host {}",
                if online { "online" } else { "offline" }
            );
            if let Err(err) = app_state
                .mqtt
                .publish(
                    TOPIC_SWITCH_STATE,
                    QoS::AtLeastOnce,
                    true,
                    switch_payload(online),
                )
                .await
            {
                warn!("switch state publish failed: {err}");
            }
        }
    });
}

fn spawn_button_task(
    app_state: AppState,
    mut edges: mpsc::Receiver<ButtonEdge>,
    mut debouncer: ButtonDebouncer,
) {
    tokio::spawn(async move {
        loop {
            // Recomputed every pass: a new tap replaces the pending deadline.
            let deadline = debouncer.deadline_ms().map(instant_at);
            let intents = tokio::select! {
                edge = edges.recv() => match edge {
                    Some(edge) => debouncer.handle_edge(edge, monotonic_ms()),
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => debouncer.tick(monotonic_ms()),
            };

            for intent in intents {
                run_intent(&app_state, intent).await;
            }
        }
    });
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_intent(app_state: &AppState, intent: ButtonIntent) {
    let result = {
        let mut dispatcher = app_state.dispatcher.lock().await;
        dispatcher.handle_intent(intent, monotonic_ms())
    };

    match result {
        Ok(IntentOutcome::Sent(command, target)) => {
            info!("button {}: {} sent to {target}", intent.as_str(), command.as_str());
        }
        Ok(IntentOutcome::FactoryReset) => {
            warn!("button {}: target erased", intent.as_str());
            app_state.restart.notify_one();
        }
        Err(Error::TargetNotConfigured) => {
            info!("button {}: no target configured", intent.as_str());
        }
        Err(err) => warn!("button {} failed: {err}", intent.as_str()),
    }
}

async fn handle_provision(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let endpoint = state.provisioning.clone();
    let result = tokio::task::spawn_blocking(move || {
        let outcome = endpoint.apply(Some(&body[..]));
        (endpoint.response(&outcome), outcome)
    })
    .await;

    let (body, outcome) = match result {
        Ok(handled) => handled,
        Err(err) => {
            warn!("provisioning task failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Provisioning failed");
        }
    };

    match outcome {
        Ok(Some(address)) => info!("target host provisioned: {address}"),
        Ok(None) => info!("provisioning request without payload; target unchanged"),
        Err(err) => warn!("provisioning rejected: {err}"),
    }

    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = monotonic_ms();
    let (online, record) = {
        let dispatcher = state.dispatcher.lock().await;
        (dispatcher.is_online(now_ms), dispatcher.store().get())
    };

    let target = match record {
        Ok(record) => record.target(),
        Err(err) => {
            warn!("target store read failed: {err}");
            None
        }
    };

    let identity = state.provisioning.identity();
    Json(StatusView {
        online,
        target_configured: target.is_some(),
        target_mac: target.map(|address| address.to_string()),
        setup_code: identity.setup_code.formatted(),
        setup_id: SETUP_ID,
    })
}

async fn handle_put_switch(
    State(state): State<AppState>,
    Json(update): Json<SwitchUpdate>,
) -> impl IntoResponse {
    if let Err(err) = apply_switch_write(&state.dispatcher, update.on).await {
        return command_error_response(&err);
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_button_tap(State(state): State<AppState>) -> impl IntoResponse {
    queue_button_edge(&state, ButtonEdge::Released).await
}

async fn handle_button_long_press(State(state): State<AppState>) -> impl IntoResponse {
    queue_button_edge(&state, ButtonEdge::LongPress).await
}

async fn queue_button_edge(state: &AppState, edge: ButtonEdge) -> axum::response::Response {
    match state.buttons.send(edge).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Button task stopped"),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("LAUNCHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.launcher"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn target_store(&self) -> FileTargetStore {
        FileTargetStore::new(self.data_dir.as_ref())
    }
}

fn command_status(err: &Error) -> StatusCode {
    match err {
        Error::TargetNotConfigured => StatusCode::CONFLICT,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::SendFailed(_) => StatusCode::BAD_GATEWAY,
        Error::StorageUnavailable { .. } | Error::StorageError { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn command_error_response(err: &Error) -> axum::response::Response {
    error_response(command_status(err), &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn monotonic_ms() -> u64 {
    start_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn instant_at(ms: u64) -> tokio::time::Instant {
    tokio::time::Instant::from_std(start_instant() + Duration::from_millis(ms))
}
