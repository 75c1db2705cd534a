use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use timer_relay_common::{
    control_topic_channel, dispatch, dispatch_payload, parse_action_payload, parse_device_command,
    ChannelId, DeviceCommand, DeviceStatus, MonotonicClock, PollReport, PollStep, RelayCommand,
    RelayEngine,
    RuntimeConfig, MAX_MQTT_PAYLOAD_BYTES, SUBSCRIBED_TOPICS, TOPIC_COMMAND, TOPIC_STATUS,
};

use crate::sim::{SimLedPin, SimRelayPin, SimSwitchBank, SimSwitchPin};

#[derive(Clone)]
struct AppState {
    engine: Arc<RelayEngine<SimRelayPin>>,
    switches: SimSwitchBank,
    device_id: Arc<str>,
    network_connected: Arc<AtomicBool>,
    clock: MonotonicClock,
    mqtt: AsyncClient,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SwitchSimParams {
    channel: i64,
    pressed: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    info!(
        "device `{}`: countdown {}s, mqtt `{}:{}`",
        runtime.device_id,
        runtime.timing.countdown_ms / 1000,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let engine = RelayEngine::new(
        runtime.timing.clone(),
        ChannelId::ALL.map(SimRelayPin::new),
    );

    let mut mqtt_options = MqttOptions::new(
        runtime.device_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(engine),
        switches: SimSwitchBank::default(),
        device_id: Arc::from(runtime.device_id.as_str()),
        network_connected: Arc::new(AtomicBool::new(false)),
        clock: MonotonicClock::start(),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_poll_loop(app_state.clone(), &runtime);
    spawn_status_publish_loop(app_state.clone(), runtime.timing.status_publish_interval_ms);

    let app = router(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/relay", post(handle_post_relay))
        .route("/api/sim/switch", post(handle_sim_switch))
        .layer(cors)
        .with_state(app_state)
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        runtime.device_id = device_id;
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in SUBSCRIBED_TOPICS {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload)
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.network_connected.store(true, Ordering::Relaxed);
                    // rumqttc only replays subscriptions within a session, so resubscribe.
                    if let Err(err) = subscribe_topics(&app_state.mqtt).await {
                        warn!("mqtt re-subscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.network_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_poll_loop(app_state: AppState, runtime: &RuntimeConfig) {
    let mut step = PollStep::new(&runtime.timing, app_state.switches.pins(), SimLedPin);
    let period = Duration::from_millis(runtime.timing.poll_interval_ms);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            poll_once(&app_state, &mut step, app_state.clock.now_ms());
        }
    });
}

fn poll_once(
    app_state: &AppState,
    step: &mut PollStep<SimSwitchPin, SimLedPin>,
    now_ms: u64,
) -> PollReport {
    let connected = app_state.network_connected.load(Ordering::Relaxed);
    let report = step.poll(&app_state.engine, connected, now_ms);
    if report.relay_changed() {
        queue_status(app_state);
    }
    report
}

fn spawn_status_publish_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            publish_status(&app_state).await;
        }
    });
}

fn build_status(state: &AppState) -> DeviceStatus {
    let now_ms = state.clock.now_ms();
    DeviceStatus::new(
        &state.device_id,
        state.network_connected.load(Ordering::Relaxed),
        None,
        state.engine.snapshot(now_ms),
    )
}

fn status_payload(state: &AppState) -> Option<Vec<u8>> {
    match serde_json::to_vec(&build_status(state)) {
        Ok(body) => Some(body),
        Err(err) => {
            warn!("status serialization failed: {err}");
            None
        }
    }
}

/// Waits for room in the request queue; only the periodic publisher may block on the broker.
async fn publish_status(state: &AppState) {
    let Some(body) = status_payload(state) else {
        return;
    };

    if let Err(err) = state
        .mqtt
        .publish(TOPIC_STATUS, QoS::AtLeastOnce, true, body)
        .await
    {
        warn!("status publish failed: {err}");
    }
}

/// Best-effort publish for the poll loop, handlers and the MQTT event loop itself.
/// Drops the update when the request queue is full instead of waiting for the broker.
fn queue_status(state: &AppState) {
    let Some(body) = status_payload(state) else {
        return;
    };

    if let Err(err) = state
        .mqtt
        .try_publish(TOPIC_STATUS, QoS::AtLeastOnce, true, body)
    {
        warn!("status update dropped: {err}");
    }
}

fn handle_mqtt_message(
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

    let now_ms = app_state.clock.now_ms();

    if let Some(channel) = control_topic_channel(topic) {
        let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
        match parse_action_payload(message) {
            Ok(action) => {
                let transition = dispatch(&app_state.engine, RelayCommand { channel, action }, now_ms);
                info!("mqtt {channel} {}: {transition:?}", action.as_str());
                queue_status(app_state);
            }
            Err(err) => warn!("rejected command on {topic}: {err:?}"),
        }
        return Ok(());
    }

    if topic == TOPIC_COMMAND {
        match parse_device_command(payload) {
            Ok(DeviceCommand::PublishStatus) => queue_status(app_state),
            Ok(DeviceCommand::Relay(command)) => {
                let transition = dispatch(&app_state.engine, command, now_ms);
                info!(
                    "mqtt {} {}: {transition:?}",
                    command.channel,
                    command.action.as_str()
                );
                queue_status(app_state);
            }
            Err(err) => warn!("rejected command on {topic}: {err:?}"),
        }
    }

    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state))
}

async fn handle_post_relay(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let now_ms = state.clock.now_ms();
    match dispatch_payload(&state.engine, &body, now_ms) {
        Ok((command, transition)) => {
            info!(
                "http {} {}: {transition:?}",
                command.channel,
                command.action.as_str()
            );
            queue_status(&state);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!("rejected relay request: {err:?}");
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

async fn handle_sim_switch(
    State(state): State<AppState>,
    Query(params): Query<SwitchSimParams>,
) -> impl IntoResponse {
    let channel = match ChannelId::try_from(params.channel) {
        Ok(channel) => channel,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    state.switches.set_pressed(channel, params.pressed);
    info!(
        "simulated {channel} switch {}",
        if params.pressed { "pressed" } else { "released" }
    );
    StatusCode::NO_CONTENT.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("TIMER_RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.timer-relay"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
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
