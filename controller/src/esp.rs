use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use timer_relay_common::{
    config::NetworkConfig, control_topic_channel, dispatch, dispatch_payload,
    parse_action_payload, parse_device_command, DeviceCommand, DeviceStatus,
    MonotonicClock, PollStep, RelayCommand, RelayEngine, RuntimeConfig, MAX_MQTT_PAYLOAD_BYTES,
    SUBSCRIBED_TOPICS, TOPIC_COMMAND, TOPIC_STATUS,
};

const NVS_NAMESPACE: &str = "timer_relay";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 20;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const RESTART_DELAY_MS: u64 = 5_000;
const INTERNET_PROBE_URL: &str = "http://www.google.com";
const INTERNET_PROBE_TIMEOUT_SEC: u64 = 5;

type RelayPin = PinDriver<'static, AnyOutputPin, Output>;
type SwitchPin = PinDriver<'static, AnyIOPin, Input>;
type LedPin = PinDriver<'static, AnyOutputPin, Output>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct SharedState {
    engine: Arc<RelayEngine<RelayPin>>,
    device_id: Arc<str>,
    clock: MonotonicClock,
    wifi_connected: Arc<AtomicBool>,
    internet_reachable: Arc<AtomicBool>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: device=`{}`, ssid=`{}`, mqtt=`{}:{}`",
        runtime.device_id,
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;

    let relay_pins = [
        output_pin(runtime.pins.relays[0])?,
        output_pin(runtime.pins.relays[1])?,
    ];
    let switch_pins = [
        switch_pin(runtime.pins.switches[0])?,
        switch_pin(runtime.pins.switches[1])?,
    ];
    let led_pin = output_pin(runtime.pins.led)?;

    let engine = RelayEngine::new(runtime.timing.clone(), relay_pins);
    info!(
        "relays on GPIO{}/GPIO{}, switches on GPIO{}/GPIO{}, LED on GPIO{}",
        runtime.pins.relays[0],
        runtime.pins.relays[1],
        runtime.pins.switches[0],
        runtime.pins.switches[1],
        runtime.pins.led,
    );

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi startup failed ({err:#}); restarting");
            restart_device();
        }
    };
    let wifi = Arc::new(Mutex::new(wifi));

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let shared_state = SharedState {
        engine: Arc::new(engine),
        device_id: Arc::from(runtime.device_id.as_str()),
        clock: MonotonicClock::start(),
        wifi_connected: Arc::new(AtomicBool::new(true)),
        internet_reachable: Arc::new(AtomicBool::new(false)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone())?;
    spawn_internet_monitor(
        shared_state.clone(),
        runtime.timing.connectivity_check_interval_ms,
    )?;
    spawn_poll_loop(
        shared_state.clone(),
        &runtime,
        PollStep::new(&runtime.timing, switch_pins, led_pin),
        wifi,
        mqtt_client.clone(),
    )?;

    let server = create_http_server(shared_state, mqtt_client)?;

    // Keep services alive for the program lifetime.
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

fn output_pin(pin: i32) -> anyhow::Result<RelayPin> {
    unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to configure GPIO{pin} as output"))
}

fn switch_pin(pin: i32) -> anyhow::Result<SwitchPin> {
    let mut driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) }
        .with_context(|| format!("failed to configure GPIO{pin} as input"))?;
    // Switches pull the line to ground when pressed.
    driver
        .set_pull(Pull::Up)
        .with_context(|| format!("failed to enable pull-up on GPIO{pin}"))?;
    Ok(driver)
}

fn create_http_server(
    state: SharedState,
    mqtt: SharedMqtt,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    server.fn_handler("/api/status", Method::Options, write_preflight)?;

    {
        let state = state.clone();
        let mqtt = mqtt.clone();
        server.fn_handler("/api/relay", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };

            match dispatch_payload(&state.engine, &body, state.clock.now_ms()) {
                Ok((command, transition)) => {
                    info!(
                        "http {} {}: {transition:?}",
                        command.channel,
                        command.action.as_str()
                    );
                    if let Err(err) = publish_status(&state, &mqtt) {
                        warn!("status publish failed: {err:#}");
                    }
                    write_empty(req)
                }
                Err(err) => {
                    warn!("rejected relay request: {err:?}");
                    write_error(req, 400, &err.to_string())
                }
            }
        })?;
    }

    server.fn_handler("/api/relay", Method::Options, write_preflight)?;

    Ok(server)
}

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

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
    write_response(req, 200, Some("OK"), &body)
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
    write_response(req, status_code, None, &body)
}

fn write_empty(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<()> {
    write_response(req, 200, Some("OK"), &[])
}

fn write_preflight(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<()> {
    write_response(req, 204, None, &[])
}

fn write_response(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    reason: Option<&str>,
    body: &[u8],
) -> anyhow::Result<()> {
    let mut headers = CORS_HEADERS.to_vec();
    if !body.is_empty() {
        headers.push(("Content-Type", "application/json; charset=utf-8"));
    }

    let mut response = req.into_response(status_code, reason, &headers)?;
    if !body.is_empty() {
        response.write_all(body)?;
    }
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if !network.has_station_credentials() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

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
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &runtime.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(runtime.device_id.as_str()),
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
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let mut mqtt = lock(mqtt);
    for topic in SUBSCRIBED_TOPICS {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }

    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Err(err) = subscribe_topics(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Fragmented payloads are never valid commands.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        if let Err(err) = handle_mqtt_message(&state, &mqtt, topic, data) {
                            warn!("mqtt message handling failed: {err:#}");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;

    Ok(())
}

fn handle_mqtt_message(
    state: &SharedState,
    mqtt: &SharedMqtt,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let now_ms = state.clock.now_ms();

    let command = if let Some(channel) = control_topic_channel(topic) {
        let message = core::str::from_utf8(payload).context("non utf8 mqtt payload")?;
        match parse_action_payload(message) {
            Ok(action) => Some(RelayCommand { channel, action }),
            Err(err) => {
                warn!("rejected command on {topic}: {err:?}");
                return Ok(());
            }
        }
    } else if topic == TOPIC_COMMAND {
        match parse_device_command(payload) {
            Ok(DeviceCommand::PublishStatus) => None,
            Ok(DeviceCommand::Relay(command)) => Some(command),
            Err(err) => {
                warn!("rejected command on {topic}: {err:?}");
                return Ok(());
            }
        }
    } else {
        return Ok(());
    };

    if let Some(command) = command {
        let transition = dispatch(&state.engine, command, now_ms);
        info!(
            "mqtt {} {}: {transition:?}",
            command.channel,
            command.action.as_str()
        );
    }

    publish_status(state, mqtt)
}

fn spawn_poll_loop(
    state: SharedState,
    runtime: &RuntimeConfig,
    mut step: PollStep<SwitchPin, LedPin>,
    wifi: Arc<Mutex<EspWifi<'static>>>,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    let poll_interval = Duration::from_millis(runtime.timing.poll_interval_ms);
    let connectivity_interval_ms = runtime.timing.connectivity_check_interval_ms;
    let publish_interval_ms = runtime.timing.status_publish_interval_ms;

    thread::Builder::new()
        .name("relay-poll".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register poll loop with watchdog: {err:#}");
            }

            let mut last_connectivity_check_ms = 0_u64;
            let mut last_status_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = state.clock.now_ms();

                if now_ms.saturating_sub(last_connectivity_check_ms) >= connectivity_interval_ms {
                    last_connectivity_check_ms = now_ms;
                    check_station_link(&state, &wifi);
                }

                let connected = state.wifi_connected.load(Ordering::Relaxed)
                    && state.internet_reachable.load(Ordering::Relaxed);
                let report = step.poll(&state.engine, connected, now_ms);

                let periodic_due =
                    now_ms.saturating_sub(last_status_publish_ms) >= publish_interval_ms;
                if report.relay_changed() || periodic_due {
                    last_status_publish_ms = now_ms;
                    if let Err(err) = publish_status(&state, &mqtt) {
                        warn!("status publish failed: {err:#}");
                    }
                }

                thread::sleep(poll_interval);
            }
        })
        .context("failed to spawn poll loop thread")?;

    Ok(())
}

/// Refreshes the station flag and kicks off a reconnect without waiting for it.
fn check_station_link(state: &SharedState, wifi: &Arc<Mutex<EspWifi<'static>>>) {
    let connected = is_wifi_station_connected();
    let was_connected = state.wifi_connected.swap(connected, Ordering::Relaxed);

    if connected {
        if !was_connected {
            info!("wifi link restored");
        }
        return;
    }

    warn!("wifi link down; requesting reconnect");
    if let Err(err) = lock(wifi).connect() {
        warn!("wifi reconnect request failed: {err}");
    }
}

fn spawn_internet_monitor(state: SharedState, interval_ms: u64) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("net-probe".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let reachable = state.wifi_connected.load(Ordering::Relaxed) && probe_internet();
            let previous = state.internet_reachable.swap(reachable, Ordering::Relaxed);
            if previous != reachable {
                info!(
                    "internet {}",
                    if reachable { "reachable" } else { "unreachable" }
                );
            }

            thread::sleep(Duration::from_millis(interval_ms));
        })
        .context("failed to spawn internet monitor thread")?;

    Ok(())
}

/// Any HTTP response counts as reachable.
fn probe_internet() -> bool {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(INTERNET_PROBE_TIMEOUT_SEC)),
        ..Default::default()
    };

    let result = EspHttpConnection::new(&http_conf)
        .map_err(|err| anyhow!("{err:?}"))
        .and_then(|conn| {
            let mut client = HttpClient::wrap(conn);
            let request = client
                .request(Method::Get, INTERNET_PROBE_URL, &[])
                .map_err(|err| anyhow!("{err:?}"))?;
            request.submit().map_err(|err| anyhow!("{err:?}"))?;
            Ok(())
        });

    match result {
        Ok(()) => true,
        Err(err) => {
            log::debug!("internet probe failed: {err:#}");
            false
        }
    }
}

fn build_status(state: &SharedState) -> DeviceStatus {
    let now_ms = state.clock.now_ms();
    DeviceStatus::new(
        &state.device_id,
        state.wifi_connected.load(Ordering::Relaxed),
        wifi_station_rssi(),
        state.engine.snapshot(now_ms),
    )
}

fn publish_status(state: &SharedState, mqtt: &SharedMqtt) -> anyhow::Result<()> {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return Ok(());
    }

    let payload = serde_json::to_vec(&build_status(state))?;
    // `enqueue` hands the message to the MQTT task instead of blocking the caller.
    lock(mqtt).enqueue(TOPIC_STATUS, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn restart_device() -> ! {
    thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
    unsafe { esp_idf_svc::sys::esp_restart() }
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

fn wifi_station_rssi() -> Option<i32> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then(|| i32::from(ap_info.rssi))
}

fn is_wifi_station_connected() -> bool {
    wifi_station_rssi().is_some()
}
