use core::convert::TryInto;
use std::{
    net::{SocketAddrV4, UdpSocket},
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{
        Details, EspMqttClient, EspMqttConnection, EventPayload, LwtConfiguration,
        MqttClientConfiguration, QoS,
    },
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use launcher_common::{
    config::{HardwareConfig, NetworkConfig},
    protocol::MAX_DATAGRAM_LEN,
    store::{STORE_NAMESPACE, STORE_TARGET_KEY},
    parse_switch_payload, switch_payload, ButtonDebouncer, ButtonIntent, Command,
    CommandDispatcher, DeviceIdentity, Error, HardwareAddress, IntentOutcome, PressTracker,
    ProvisioningEndpoint, RuntimeConfig, TargetRecord, TargetStore, PAYLOAD_OFFLINE,
    PAYLOAD_ONLINE, SETUP_ID, TOPIC_STATUS, TOPIC_SWITCH_SET, TOPIC_SWITCH_STATE,
};

use crate::net::UdpBroadcaster;

const NVS_NAMESPACE: &str = "launcher";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BUTTON_SAMPLE_MS: u64 = 10;
const BLINK_HALF_PERIOD_MS: u64 = 300;
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;

const BLINKS_NO_TARGET: u32 = 1;
const BLINKS_WAKE_SENT: u32 = 2;
const BLINKS_IDENTIFY: u32 = 3;
const BLINKS_SEND_FAILED: u32 = 4;
const BLINKS_STORE_UNAVAILABLE: u32 = 8;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

type Dispatcher = CommandDispatcher<NvsTargetStore, UdpBroadcaster>;
type MqttClient = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct SharedState {
    dispatcher: Arc<Mutex<Dispatcher>>,
    provisioning: Arc<ProvisioningEndpoint<NvsTargetStore>>,
    led: mpsc::Sender<LedSignal>,
    mqtt: Option<MqttClient>,
}

#[derive(Debug, Clone, Copy)]
enum LedSignal {
    // Lit while the target host is online.
    Steady(bool),
    Blink(u32),
}

// Active-low.
struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    steady: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

// Target record in the `prov` namespace as a 6-byte blob.
#[derive(Clone)]
struct NvsTargetStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

#[derive(Debug, Deserialize)]
struct NetworkUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };
    let target_store = NvsTargetStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    let identity = DeviceIdentity::new(read_station_mac()?);
    info!(
        "accessory serial {} setup code {} (setup id {SETUP_ID})",
        identity.serial_number(),
        identity.setup_code.formatted(),
    );

    match target_store.get() {
        Ok(record) => match record.target() {
            Some(target) => info!("target host {target}"),
            None => info!("no target host configured"),
        },
        Err(err) => warn!("target store unreadable: {err}"),
    }

    let led = spawn_status_led(runtime.hardware.led_pin);

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network, &identity)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi) => {
            warn!(
                "wifi station connection unavailable; provisioning AP `{}` is up",
                identity.service_name()
            );
            let provisioning = ProvisioningEndpoint::new(target_store, identity);
            let server = create_provisioning_http_server(nvs_store, provisioning)?;

            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    disable_wifi_power_save();
    // Lit from power-on until the station is up.
    let _ = led.send(LedSignal::Steady(false));

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let transport = UdpBroadcaster::bind(runtime.network.broadcast_addr)
        .context("failed to open broadcast socket")?;
    let state = SharedState {
        dispatcher: Arc::new(Mutex::new(CommandDispatcher::new(
            target_store.clone(),
            transport,
            &runtime,
        ))),
        provisioning: Arc::new(ProvisioningEndpoint::new(target_store, identity)),
        led,
        mqtt: None,
    };
    let state = match create_mqtt_client(&runtime.network) {
        Ok((client, conn)) => {
            let client = Arc::new(Mutex::new(client));
            let state = SharedState {
                mqtt: Some(client),
                ..state
            };
            spawn_mqtt_receiver(state.clone(), conn);
            state
        }
        Err(err) => {
            warn!("mqtt unavailable, switch mirror disabled: {err:#}");
            state
        }
    };

    spawn_heartbeat_listener(state.clone(), runtime.network.heartbeat_port);
    spawn_presence_loop(
        state.clone(),
        Duration::from_millis(runtime.presence.poll_interval_ms),
    );
    spawn_button(state.clone(), &runtime);

    let server = create_http_server(state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn read_station_mac() -> anyhow::Result<HardwareAddress> {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("esp_read_mac failed with code {rc}"));
    }
    Ok(HardwareAddress::new(mac))
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/prov/targetMAC", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let response = handle_provisioning(&state.provisioning, &body);
            write_raw_json(req, &response)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let payload = build_status(&state);
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/switch", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: SwitchUpdate =
                serde_json::from_slice(&body).context("invalid switch payload")?;

            if let Err(err) = apply_switch_write(&state, update.on) {
                return write_error(req, command_status(&err), &err.to_string());
            }

            let payload = build_status(&state);
            write_json(req, &payload)
        })?;
    }

    server.fn_handler("/api/identify", Method::Post, move |req| {
        info!("accessory identified");
        let _ = state.led.send(LedSignal::Blink(BLINKS_IDENTIFY));
        write_json(req, &serde_json::json!({ "identified": true }))
    })?;

    Ok(server)
}

fn create_provisioning_http_server(
    nvs_store: NvsStore,
    provisioning: ProvisioningEndpoint<NvsTargetStore>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/prov/targetMAC", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let response = handle_provisioning(&provisioning, &body);
        write_raw_json(req, &response)
    })?;

    server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: NetworkUpdate =
            serde_json::from_slice(&body).context("invalid network payload")?;
        if update.wifi_ssid.trim().is_empty() {
            return write_error(req, 400, "wifiSsid is required");
        }

        let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
        runtime.network.wifi_ssid = update.wifi_ssid;
        runtime.network.wifi_pass = update.wifi_pass;
        nvs_store.save_runtime_config(&runtime)?;

        schedule_restart("prov-restart", Duration::from_secs(3))?;
        write_json(req, &serde_json::json!({ "restartRequired": true }))
    })?;

    Ok(server)
}

fn handle_provisioning(endpoint: &ProvisioningEndpoint<NvsTargetStore>, body: &[u8]) -> Vec<u8> {
    let outcome = endpoint.apply(Some(body));
    match &outcome {
        Ok(Some(address)) => info!("target host provisioned: {address}"),
        Ok(None) => info!("provisioning request without payload; target unchanged"),
        Err(err) => warn!("provisioning rejected: {err}"),
    }
    endpoint.response(&outcome)
}

fn build_status(state: &SharedState) -> StatusView {
    let now_ms = monotonic_ms();
    let (online, record) = {
        let dispatcher = state.dispatcher.lock().unwrap();
        (dispatcher.is_online(now_ms), dispatcher.store().get())
    };
    let target = record.ok().and_then(|record| record.target());
    let identity = state.provisioning.identity();

    StatusView {
        online,
        target_configured: target.is_some(),
        target_mac: target.map(|address| address.to_string()),
        setup_code: identity.setup_code.formatted(),
        setup_id: SETUP_ID,
    }
}

fn command_status(err: &Error) -> u16 {
    match err {
        Error::TargetNotConfigured => 409,
        Error::InvalidArgument(_) => 400,
        Error::SendFailed(_) => 502,
        Error::StorageUnavailable { .. } | Error::StorageError { .. } => 503,
    }
}

// Without a target the switch still reports success; the write is dropped.
fn apply_switch_write(state: &SharedState, on: bool) -> launcher_common::Result<()> {
    let command = Command::from_switch(on);
    let result = {
        let mut dispatcher = state.dispatcher.lock().unwrap();
        dispatcher
            .send(command, monotonic_ms())
            .map(|target| (command, target))
    };
    let label = format!("switch {}", switch_payload(on));
    report_command(state, &label, &result);

    match result {
        Ok(_) | Err(Error::TargetNotConfigured) => Ok(()),
        Err(err) => Err(err),
    }
}

// Logs a command outcome and queues its diagnostic blink pattern.
fn report_command(
    state: &SharedState,
    label: &str,
    result: &launcher_common::Result<(Command, HardwareAddress)>,
) {
    let blinks = match result {
        Ok((command, target)) => {
            info!("{label}: {} sent to {target}", command.as_str());
            if *command != Command::Wake {
                return;
            }
            BLINKS_WAKE_SENT
        }
        Err(Error::TargetNotConfigured) => {
            info!("{label}: no target configured");
            BLINKS_NO_TARGET
        }
        Err(err @ (Error::StorageUnavailable { .. } | Error::StorageError { .. })) => {
            warn!("{label}: {err}");
            BLINKS_STORE_UNAVAILABLE
        }
        Err(err) => {
            warn!("{label}: {err}");
            BLINKS_SEND_FAILED
        }
    };
    let _ = state.led.send(LedSignal::Blink(blinks));
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    write_raw_json(req, &body)
}

fn write_raw_json(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    body: &[u8],
) -> anyhow::Result<()> {
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    !network.wifi_ssid.trim().is_empty()
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    identity: &DeviceIdentity,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi, identity)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi, identity)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

// Access point named after the device, secured with its proof of possession.
fn start_provisioning_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    identity: &DeviceIdentity,
) -> anyhow::Result<()> {
    let ssid = identity.service_name();
    let password = identity.proof_of_possession();

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{ssid}` (password: `{password}`)");
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    if network.mqtt_host.trim().is_empty() {
        return Err(anyhow!("no mqtt host configured"));
    }
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("launcher-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: TOPIC_STATUS,
            payload: PAYLOAD_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

// Queued without blocking; runs on the receiver thread.
fn announce(state: &SharedState, mqtt: &MqttClient) -> anyhow::Result<()> {
    let online = state.dispatcher.lock().unwrap().presence().last_reported();

    let mut client = mqtt.lock().unwrap();
    client.subscribe(TOPIC_SWITCH_SET, QoS::AtLeastOnce)?;
    client.enqueue(TOPIC_STATUS, QoS::AtLeastOnce, true, PAYLOAD_ONLINE.as_bytes())?;
    client.enqueue(
        TOPIC_SWITCH_STATE,
        QoS::AtLeastOnce,
        true,
        switch_payload(online).as_bytes(),
    )?;
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("mqtt connected");
                    if let Some(mqtt) = state.mqtt.as_ref() {
                        if let Err(err) = announce(&state, mqtt) {
                            warn!("mqtt announce failed: {err:#}");
                        }
                    }
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => {
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }
                    if topic != TOPIC_SWITCH_SET {
                        continue;
                    }
                    match parse_switch_payload(data) {
                        Some(on) => {
                            let _ = apply_switch_write(&state, on);
                        }
                        None => warn!(
                            "ignoring switch payload `{}`",
                            String::from_utf8_lossy(data)
                        ),
                    }
                }
                _ => {}
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_heartbeat_listener(state: SharedState, port: u16) {
    thread::Builder::new()
        .name("udp-heartbeat".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let socket = match UdpSocket::bind(SocketAddrV4::new([0, 0, 0, 0].into(), port)) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("heartbeat listener could not bind port {port}: {err}");
                    return;
                }
            };

            let mut buf = [0_u8; MAX_DATAGRAM_LEN];
            loop {
                let len = match socket.recv_from(&mut buf) {
                    Ok((len, _)) => len,
                    Err(err) => {
                        warn!("heartbeat receive failed: {err}");
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };

                let result = {
                    let mut dispatcher = state.dispatcher.lock().unwrap();
                    dispatcher.heartbeat_datagram(&buf[..len], monotonic_ms())
                };
                if let Err(err) = result {
                    warn!("heartbeat dropped: {err}");
                }
            }
        })
        .expect("failed to spawn heartbeat listener thread");
}

fn spawn_presence_loop(state: SharedState, period: Duration) {
    thread::Builder::new()
        .name("presence-loop".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register presence loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();
                let flipped = {
                    let mut dispatcher = state.dispatcher.lock().unwrap();
                    dispatcher.poll_online(monotonic_ms())
                };
                if let Some(online) = flipped {
                    info!("target host {}", if online { "online" } else { "offline" });
                    let _ = state.led.send(LedSignal::Steady(online));
                    if let Some(mqtt) = state.mqtt.as_ref() {
                        let mut client = mqtt.lock().unwrap();
                        if let Err(err) = client.publish(
                            TOPIC_SWITCH_STATE,
                            QoS::AtLeastOnce,
                            true,
                            switch_payload(online).as_bytes(),
                        ) {
                            warn!("switch state publish failed: {err}");
                        }
                    }
                }
                thread::sleep(period);
            }
        })
        .expect("failed to spawn presence loop thread");
}

fn spawn_button(state: SharedState, runtime: &RuntimeConfig) {
    let hardware = runtime.hardware.clone();
    let mut tracker = PressTracker::new(&runtime.button);
    let mut debouncer = ButtonDebouncer::from_config(&runtime.button);

    thread::Builder::new()
        .name("button".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let button = match init_button(&hardware) {
                Ok(button) => button,
                Err(err) => {
                    warn!("button unavailable on GPIO{}: {err:#}", hardware.button_pin);
                    return;
                }
            };

            loop {
                let now_ms = monotonic_ms();
                let pressed = if hardware.button_active_low {
                    button.is_low()
                } else {
                    button.is_high()
                };

                let mut intents = match tracker.sample(pressed, now_ms) {
                    Some(edge) => debouncer.handle_edge(edge, now_ms),
                    None => Vec::new(),
                };
                intents.extend(debouncer.tick(now_ms));

                for intent in intents {
                    run_intent(&state, intent);
                }
                thread::sleep(Duration::from_millis(BUTTON_SAMPLE_MS));
            }
        })
        .expect("failed to spawn button thread");
}

fn init_button(
    hardware: &HardwareConfig,
) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut pin = unsafe { PinDriver::input(AnyIOPin::new(hardware.button_pin)) }?;
    pin.set_pull(if hardware.button_active_low {
        Pull::Up
    } else {
        Pull::Down
    })?;
    Ok(pin)
}

fn run_intent(state: &SharedState, intent: ButtonIntent) {
    let result = {
        let mut dispatcher = state.dispatcher.lock().unwrap();
        dispatcher.handle_intent(intent, monotonic_ms())
    };

    match result {
        Ok(IntentOutcome::Sent(command, target)) => {
            report_command(
                state,
                &format!("button {}", intent.as_str()),
                &Ok((command, target)),
            );
        }
        Ok(IntentOutcome::FactoryReset) => {
            warn!("button {}: storage erased, restarting", intent.as_str());
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Err(err) => {
            report_command(state, &format!("button {}", intent.as_str()), &Err(err));
        }
    }
}

fn spawn_status_led(pin: i32) -> mpsc::Sender<LedSignal> {
    let (sender, receiver) = mpsc::channel::<LedSignal>();
    let mut led = init_status_led(pin);
    if let Some(led) = led.as_mut() {
        led.set_steady(true);
    }

    let spawned = thread::Builder::new()
        .name("status-led".into())
        .stack_size(3 * 1024)
        .spawn(move || {
            for signal in receiver {
                let Some(led) = led.as_mut() else {
                    continue;
                };
                match signal {
                    LedSignal::Steady(lit) => led.set_steady(lit),
                    LedSignal::Blink(count) => led.blink(count),
                }
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn status LED thread: {err}");
    }
    sender
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(pin) => Some(StatusLed { pin, steady: false }),
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

impl StatusLed {
    fn set_steady(&mut self, lit: bool) {
        self.steady = lit;
        self.set_lit(lit);
    }

    fn set_lit(&mut self, lit: bool) {
        let result = if lit {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        }
    }

    fn blink(&mut self, count: u32) {
        for _ in 0..count {
            self.set_lit(true);
            thread::sleep(Duration::from_millis(BLINK_HALF_PERIOD_MS));
            self.set_lit(false);
            thread::sleep(Duration::from_millis(BLINK_HALF_PERIOD_MS));
        }
        self.set_lit(self.steady);
    }
}

fn schedule_restart(name: &str, delay: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            thread::sleep(delay);
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

impl NvsTargetStore {
    fn open(&self) -> launcher_common::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        EspNvs::new(self.partition.clone(), STORE_NAMESPACE, true)
            .map_err(|err| {
                Error::storage_unavailable(err.code(), format!("nvs open failed: {err}"))
            })
    }
}

impl TargetStore for NvsTargetStore {
    fn get(&self) -> launcher_common::Result<TargetRecord> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let nvs = self.open()?;
        let mut buffer = [0_u8; HardwareAddress::LEN];

        // Any read failure, including a blob of the wrong size, means "not configured".
        let record = match nvs.get_raw(STORE_TARGET_KEY, &mut buffer) {
            Ok(Some(raw)) => HardwareAddress::from_slice(raw)
                .map(TargetRecord::configured)
                .unwrap_or_default(),
            Ok(None) | Err(_) => TargetRecord::unset(),
        };
        Ok(record)
    }

    fn set(&self, address: HardwareAddress) -> launcher_common::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut nvs = self.open()?;
        nvs.set_raw(STORE_TARGET_KEY, address.as_bytes())
            .map_err(|err| Error::storage_error(err.code(), err.to_string()))?;
        Ok(())
    }

    fn erase(&self) -> launcher_common::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_erase() };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(Error::storage_error(rc, "nvs_flash_erase failed"));
        }
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

// Broadcast heartbeats are dropped while the radio dozes.
fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
