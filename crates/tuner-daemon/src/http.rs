use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tuner_core::{ControlCommand, CoreEvent, TunerView};
use tuner_proto::protocol::{AudioLevels, PlaybackState};

#[derive(Clone)]
struct HttpState {
    view: watch::Receiver<TunerView>,
    event_tx: mpsc::Sender<CoreEvent>,
}

#[derive(Serialize)]
struct ApiState {
    stations: Vec<StationInfo>,
    current_station: Option<usize>,
    playback: PlaybackState,
    volume: u8,
    tuning: bool,
    now_playing: Option<String>,
}

#[derive(Serialize)]
struct StationInfo {
    idx: usize,
    station_id: String,
    name: String,
    frequency: String,
}

#[derive(Serialize)]
struct Levels {
    levels: AudioLevels,
}

pub fn router(view: watch::Receiver<TunerView>, event_tx: mpsc::Sender<CoreEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/levels", get(get_levels))
        .route("/api/tune/up", post(tune_up))
        .route("/api/tune/down", post(tune_down))
        .route("/api/play", post(toggle_play))
        .route("/api/volume/:percent", post(set_volume))
        .route("/api/select/:idx", post(select_station))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { view, event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    view: watch::Receiver<TunerView>,
    event_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(view, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let view = state.view.borrow().clone();
    let stations = view
        .stations
        .iter()
        .enumerate()
        .map(|(idx, s)| StationInfo {
            idx,
            station_id: s.station_id.clone(),
            name: s.name.clone(),
            frequency: s.frequency.label(),
        })
        .collect();

    Json(ApiState {
        stations,
        current_station: view.selection,
        playback: view.playback,
        volume: (view.volume * 100.0).round() as u8,
        tuning: view.tuning,
        now_playing: view.now_playing_line,
    })
}

async fn get_levels(State(state): State<HttpState>) -> Json<Levels> {
    Json(Levels {
        levels: state.view.borrow().levels,
    })
}

async fn forward(state: &HttpState, cmd: ControlCommand) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command, core loop gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn tune_up(State(state): State<HttpState>) -> StatusCode {
    forward(&state, ControlCommand::TuneUp).await
}

async fn tune_down(State(state): State<HttpState>) -> StatusCode {
    forward(&state, ControlCommand::TuneDown).await
}

async fn toggle_play(State(state): State<HttpState>) -> StatusCode {
    forward(&state, ControlCommand::TogglePlay).await
}

async fn set_volume(State(state): State<HttpState>, Path(percent): Path<u32>) -> StatusCode {
    let percent = percent.min(100) as u8;
    forward(&state, ControlCommand::SetVolumePercent(percent)).await
}

async fn select_station(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    forward(&state, ControlCommand::Select(idx)).await
}
