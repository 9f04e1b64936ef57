//! Read-only JSON API plus the SSE event feed.

pub mod events;

use std::path::PathBuf;

use axum::{
    Json,
    Router,
    extract::{
        Path,
        Query,
        State,
    },
    http::StatusCode,
    response::{
        IntoResponse,
        Response,
    },
    routing,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::{
    TcpListener,
    ToSocketAddrs,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aprs::grid,
    engine::{
        Engine,
        SharedConfig,
        StationSort,
    },
    events::EventBus,
    station::Station,
};

#[derive(Clone)]
pub struct Api {
    pub engine: Engine,
    pub config: SharedConfig,
    pub config_path: PathBuf,
    pub events: EventBus,
    pub shutdown: CancellationToken,
}

impl Api {
    pub fn router(&self) -> Router<()> {
        Router::new()
            .route("/api/stations", routing::get(get_stations))
            .route("/api/stations/:callsign", routing::get(get_station))
            .route("/api/weather", routing::get(get_weather))
            .route("/api/messages", routing::get(get_messages))
            .route("/api/monitored_messages", routing::get(get_monitored_messages))
            .route("/api/digipeaters", routing::get(get_digipeaters))
            .route("/api/digipeaters/:callsign", routing::get(get_digipeater))
            .route("/api/status", routing::get(get_status))
            .route("/api/gps", routing::get(get_gps))
            .route("/api/events", routing::get(events::get_events))
            .route("/api/beacon/comment", routing::post(post_beacon_comment))
            .fallback(routing::get(not_found))
            .with_state(self.clone())
    }

    pub async fn serve(&self, listen_address: impl ToSocketAddrs) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(listen_address).await?;
        tracing::info!(local = %listener.local_addr()?, "web API listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Station list entries carry everything except the bulky histories.
fn station_summary(station: &Station) -> serde_json::Value {
    let mut value = serde_json::to_value(station).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("position_history");
        map.remove("weather_history");
        map.remove("telemetry_history");
        map.remove("receptions");
        map.insert("has_position".to_owned(), json!(station.last_position.is_some()));
        map.insert("has_weather".to_owned(), json!(station.last_weather.is_some()));
        map.insert(
            "hop_count".to_owned(),
            json!(station.min_hop_count()),
        );
    }
    value
}

#[derive(Deserialize)]
struct StationsQuery {
    #[serde(default)]
    sort_by: Option<String>,
}

async fn get_stations(State(api): State<Api>, Query(query): Query<StationsQuery>) -> Response {
    let sort = StationSort::from_query(query.sort_by.as_deref().unwrap_or("last"));
    let stations = api.engine.stations(sort).await;
    Json(json!({
        "stations": stations.iter().map(station_summary).collect::<Vec<_>>(),
        "count": stations.len(),
    }))
    .into_response()
}

async fn get_station(State(api): State<Api>, Path(callsign): Path<String>) -> Response {
    match api.engine.station(callsign.trim_end_matches('*')).await {
        Some(station) => Json(station).into_response(),
        None => (StatusCode::NOT_FOUND, format!("station {callsign} not found")).into_response(),
    }
}

async fn get_weather(State(api): State<Api>) -> Response {
    let stations = api.engine.weather_stations().await;
    Json(json!({
        "stations": stations.iter().map(station_summary).collect::<Vec<_>>(),
        "count": stations.len(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    unread_only: Option<bool>,
}

async fn get_messages(State(api): State<Api>, Query(query): Query<MessagesQuery>) -> Response {
    let messages = api.engine.messages(query.unread_only.unwrap_or(false)).await;
    let count = messages.len();
    Json(json!({
        "messages": messages,
        "count": count,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct MonitoredQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    callsign: Option<String>,
}

async fn get_monitored_messages(
    State(api): State<Api>,
    Query(query): Query<MonitoredQuery>,
) -> Response {
    let messages = api
        .engine
        .monitored_messages(query.limit, query.callsign)
        .await;
    let count = messages.len();
    Json(json!({
        "messages": messages,
        "count": count,
    }))
    .into_response()
}

async fn get_digipeaters(State(api): State<Api>) -> Response {
    let stations = api.engine.digipeaters().await;
    let coverage: Vec<serde_json::Value> = stations
        .iter()
        .map(|digi| {
            json!({
                "callsign": digi.callsign,
                "last_heard": digi.last_heard,
                "position": digi.last_position,
                "packets_heard": digi.packets_heard,
            })
        })
        .collect();
    Json(json!({
        "digipeaters": coverage,
        "count": coverage.len(),
    }))
    .into_response()
}

async fn get_digipeater(State(api): State<Api>, Path(callsign): Path<String>) -> Response {
    match api.engine.station(&callsign).await {
        Some(station) if station.is_digipeater => {
            // stations relayed through this digi, for the coverage map
            let heard = api
                .engine
                .stations(StationSort::Last)
                .await
                .into_iter()
                .filter(|s| s.digipeaters_heard_by.contains(&station.callsign))
                .map(|s| {
                    json!({
                        "callsign": s.callsign,
                        "position": s.last_position,
                        "last_heard": s.last_heard,
                    })
                })
                .collect::<Vec<_>>();
            Json(json!({
                "station": station_summary(&station),
                "heard_stations": heard,
            }))
            .into_response()
        }
        Some(_) => (StatusCode::NOT_FOUND, format!("{callsign} is not a digipeater")).into_response(),
        None => (StatusCode::NOT_FOUND, format!("station {callsign} not found")).into_response(),
    }
}

async fn get_status(State(api): State<Api>) -> Response {
    match api.engine.status().await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Without GPS hardware the "fix" is the configured locator.
async fn get_gps(State(api): State<Api>) -> Response {
    let location = api.config.read().mylocation.clone();
    if location.is_empty() {
        return Json(json!({
            "fix": false,
            "latitude": null,
            "longitude": null,
            "grid": null,
        }))
        .into_response();
    }
    match grid::maidenhead_to_latlon(&location) {
        Ok((latitude, longitude)) => {
            Json(json!({
                "fix": false,
                "source": "MYLOCATION",
                "latitude": latitude,
                "longitude": longitude,
                "grid": location,
            }))
            .into_response()
        }
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct BeaconCommentRequest {
    password: Option<String>,
    comment: String,
    #[serde(default)]
    tx: bool,
}

/// The one mutating endpoint. Guarded by `WEBUI_PASSWORD`; an unset
/// password disables it outright.
async fn post_beacon_comment(
    State(api): State<Api>,
    Json(request): Json<BeaconCommentRequest>,
) -> Response {
    {
        let config = api.config.read();
        if config.webui_password.is_empty() {
            return (StatusCode::UNAUTHORIZED, "WEBUI_PASSWORD is not configured").into_response();
        }
        if request.password.as_deref() != Some(config.webui_password.as_str()) {
            return (StatusCode::UNAUTHORIZED, "bad password").into_response();
        }
    }

    if request.comment.len() > 128 {
        return (StatusCode::BAD_REQUEST, "comment too long").into_response();
    }

    {
        let mut config = api.config.write();
        config.beacon_comment = request.comment.clone();
        if let Err(error) = config.save(&api.config_path) {
            tracing::warn!(?error, "config save failed");
        }
    }

    let mut transmitted = false;
    if request.tx {
        match api.engine.send_beacon().await {
            Ok(()) => transmitted = true,
            Err(error) => {
                return (StatusCode::BAD_REQUEST, error).into_response();
            }
        }
    }

    Json(json!({
        "status": "ok",
        "comment": request.comment,
        "transmitted": transmitted,
    }))
    .into_response()
}
