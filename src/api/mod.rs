use axum::{
    Router,
    extract::{Json, Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{
    CsvDataSource, PatientDataSource, PatientId, SEGMENT_STEPS, ScenarioSource,
    SimulatorSettings, Stage, StageView, T1dFactory, T1dSimulator, Transition, WizardCommand,
    WizardConfig, WizardContext, WizardError, WizardSession,
};

const INDEX_HTML: &str = include_str!("../../web/index.html");
const STYLES_CSS: &str = include_str!("../../web/styles.css");
const APP_JS: &str = include_str!("../../web/app.js");

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliScenario {
    Reference,
    Seeded,
}

#[derive(Parser, Debug)]
#[command(
    name = "glucose-wizard",
    about = "Segment-by-segment insulin dosing wizard over a simulated type-1 patient"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the dashboard and its JSON API.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(
        long,
        default_value = "vpatient_params.csv",
        help = "Patient parameter table, relative to --data-dir unless absolute"
    )]
    pub params_file: PathBuf,
    #[arg(
        long,
        default_value_t = 10.0,
        help = "Carbohydrate grams at which a meal schedules the bolus"
    )]
    pub meal_threshold: f64,
    #[arg(
        long,
        default_value_t = 10,
        help = "Steps between the bolus and the detected meal"
    )]
    pub bolus_lead_steps: usize,
    #[arg(long, default_value_t = 5.0, help = "Largest accepted bolus in U")]
    pub max_bolus: f64,
    #[arg(long, default_value_t = 0.05, help = "Largest accepted basal in U/min")]
    pub max_basal: f64,
    #[arg(long, default_value_t = 1.0)]
    pub default_bolus: f64,
    #[arg(long, default_value_t = 0.02)]
    pub default_basal: f64,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "CGM noise standard deviation in mg/dL, 0 disables noise"
    )]
    pub sensor_noise: f64,
    #[arg(long, value_enum, default_value_t = CliScenario::Reference)]
    pub scenario: CliScenario,
    #[arg(long, default_value_t = 42)]
    pub scenario_seed: u64,
    #[arg(
        long,
        default_value_t = 60,
        help = "Minutes without a request before a session is dropped"
    )]
    pub session_idle_minutes: i64,
    #[arg(long, default_value_t = 500, help = "Open sessions kept at most")]
    pub max_sessions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub params_path: PathBuf,
    pub wizard: WizardConfig,
    pub simulator: SimulatorSettings,
    pub sessions: SessionLimits,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionLimits {
    pub idle_ttl: Duration,
    pub capacity: usize,
}

pub fn build_config(args: ServeArgs) -> Result<ServerConfig, String> {
    if !args.meal_threshold.is_finite() || args.meal_threshold <= 0.0 {
        return Err("--meal-threshold must be > 0".to_string());
    }

    if args.bolus_lead_steps >= SEGMENT_STEPS {
        return Err(format!("--bolus-lead-steps must be < {SEGMENT_STEPS}"));
    }

    if !args.max_bolus.is_finite() || args.max_bolus <= 0.0 {
        return Err("--max-bolus must be > 0".to_string());
    }

    if !args.max_basal.is_finite() || args.max_basal <= 0.0 {
        return Err("--max-basal must be > 0".to_string());
    }

    if !(0.0..=args.max_bolus).contains(&args.default_bolus) {
        return Err("--default-bolus must be between 0 and --max-bolus".to_string());
    }

    if !(0.0..=args.max_basal).contains(&args.default_basal) {
        return Err("--default-basal must be between 0 and --max-basal".to_string());
    }

    if !args.sensor_noise.is_finite() || args.sensor_noise < 0.0 {
        return Err("--sensor-noise must be >= 0".to_string());
    }

    if args.session_idle_minutes <= 0 {
        return Err("--session-idle-minutes must be > 0".to_string());
    }

    if args.max_sessions == 0 {
        return Err("--max-sessions must be > 0".to_string());
    }

    let params_path = if args.params_file.is_absolute() {
        args.params_file
    } else {
        args.data_dir.join(&args.params_file)
    };

    let scenario = match args.scenario {
        CliScenario::Reference => ScenarioSource::Reference,
        CliScenario::Seeded => ScenarioSource::Seeded(args.scenario_seed),
    };

    Ok(ServerConfig {
        port: args.port,
        data_dir: args.data_dir,
        params_path,
        wizard: WizardConfig {
            meal_threshold_grams: args.meal_threshold,
            bolus_lead_steps: args.bolus_lead_steps,
            default_bolus: args.default_bolus,
            default_basal: args.default_basal,
            max_bolus: args.max_bolus,
            max_basal: args.max_basal,
            ..WizardConfig::default()
        },
        simulator: SimulatorSettings {
            sensor_noise_sd: args.sensor_noise,
            max_basal: args.max_basal,
            max_bolus: args.max_bolus,
            scenario,
            ..SimulatorSettings::default()
        },
        sessions: SessionLimits {
            idle_ttl: Duration::minutes(args.session_idle_minutes),
            capacity: args.max_sessions,
        },
    })
}

struct OpenSession {
    session: WizardSession<T1dSimulator>,
    touched: DateTime<Utc>,
}

/// Open wizard sessions. Idle ones expire after `idle_ttl`; at capacity the
/// least recently used one makes room for a new session.
struct Sessions {
    open: HashMap<Uuid, OpenSession>,
    limits: SessionLimits,
}

impl Sessions {
    fn new(limits: SessionLimits) -> Self {
        Self {
            open: HashMap::new(),
            limits,
        }
    }

    fn len(&self) -> usize {
        self.open.len()
    }

    fn is_expired(&self, entry: &OpenSession, now: DateTime<Utc>) -> bool {
        now - entry.touched >= self.limits.idle_ttl
    }

    /// Drops expired sessions, then the least recently used ones until a new
    /// session fits. Returns how many were dropped.
    fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.open.len();
        let ttl = self.limits.idle_ttl;
        self.open.retain(|_, entry| now - entry.touched < ttl);
        while self.open.len() >= self.limits.capacity {
            let Some(oldest) = self
                .open
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.open.remove(&oldest);
        }
        before - self.open.len()
    }

    fn insert(&mut self, id: Uuid, now: DateTime<Utc>) -> usize {
        let evicted = self.evict(now);
        self.open.insert(
            id,
            OpenSession {
                session: WizardSession::new(),
                touched: now,
            },
        );
        evicted
    }

    /// Marks the session as used. An expired session is dropped instead.
    fn touch(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<&mut WizardSession<T1dSimulator>> {
        let expired = self.is_expired(self.open.get(&id)?, now);
        if expired {
            self.open.remove(&id);
            return None;
        }
        let entry = self.open.get_mut(&id)?;
        entry.touched = now;
        Some(&mut entry.session)
    }

    fn get(&self, id: Uuid) -> Option<&WizardSession<T1dSimulator>> {
        self.open.get(&id).map(|entry| &entry.session)
    }

    fn remove(&mut self, id: Uuid) {
        self.open.remove(&id);
    }
}

struct Services {
    config: WizardConfig,
    factory: T1dFactory,
    data: Arc<dyn PatientDataSource>,
}

#[derive(Clone)]
pub struct AppState {
    services: Arc<Services>,
    sessions: Arc<Mutex<Sessions>>,
}

impl AppState {
    pub fn new(
        config: WizardConfig,
        limits: SessionLimits,
        factory: T1dFactory,
        data: Arc<dyn PatientDataSource>,
    ) -> Self {
        Self {
            services: Arc::new(Services {
                config,
                factory,
                data,
            }),
            sessions: Arc::new(Mutex::new(Sessions::new(limits))),
        }
    }

    pub fn load(config: &ServerConfig) -> Result<Self, WizardError> {
        let source = CsvDataSource::open(&config.data_dir, &config.params_path)?;
        let factory = T1dFactory::new(source.table().clone(), config.simulator);
        info!(
            data_dir = %config.data_dir.display(),
            patients = source.table().len(),
            "patient data source opened"
        );
        Ok(Self::new(
            config.wizard.clone(),
            config.sessions,
            factory,
            Arc::new(source),
        ))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatientsResponse {
    patients: Vec<PatientId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: Uuid,
    stage: Stage,
    transition: Option<Transition>,
    view: StageView,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .route("/styles.css", get(styles_handler))
        .route("/app.js", get(app_js_handler))
        .route("/api/patients", get(patients_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", get(session_handler))
        .route("/api/sessions/:id/commands", post(command_handler))
        .fallback(not_found_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(state: AppState, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "glucose wizard listening");
    info!("local access: http://127.0.0.1:{port}/");

    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    with_cache_control(Html(INDEX_HTML))
}

async fn styles_handler() -> impl IntoResponse {
    with_cache_control((
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        STYLES_CSS,
    ))
}

async fn app_js_handler() -> impl IntoResponse {
    with_cache_control((
        [(
            header::CONTENT_TYPE,
            "application/javascript; charset=utf-8",
        )],
        APP_JS,
    ))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn patients_handler(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        PatientsResponse {
            patients: state.services.data.patients(),
        },
    )
}

async fn create_session_handler(State(state): State<AppState>) -> Response {
    let id = Uuid::new_v4();
    let mut sessions = state.sessions.lock().unwrap_or_else(PoisonError::into_inner);
    let evicted = sessions.insert(id, Utc::now());
    if evicted > 0 {
        info!(evicted, "idle sessions dropped");
    }
    info!(session = %id, open_sessions = sessions.len(), "session created");
    render_session(&state.services, &mut sessions, id, None, StatusCode::CREATED)
}

async fn session_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let mut sessions = state.sessions.lock().unwrap_or_else(PoisonError::into_inner);
    if sessions.touch(id, Utc::now()).is_none() {
        return unknown_session(id);
    }
    render_session(&state.services, &mut sessions, id, None, StatusCode::OK)
}

async fn command_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<WizardCommand>, JsonRejection>,
) -> Response {
    let command = match payload {
        Ok(Json(command)) => command,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid command payload: {}", rejection.body_text()),
            );
        }
    };

    let services = &state.services;
    let mut sessions = state.sessions.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(session) = sessions.touch(id, Utc::now()) else {
        return unknown_session(id);
    };

    let ctx = context(services);
    match session.apply(command, &ctx) {
        Ok(transition) => render_session(services, &mut sessions, id, Some(transition), StatusCode::OK),
        Err(err) => {
            if err.is_programming_error() {
                error!(session = %id, error = %err, "session discarded");
                sessions.remove(id);
            } else if err.aborts_run() {
                warn!(session = %id, error = %err, "run aborted, back to patient selection");
            }
            error_response(status_for(&err), &err.to_string())
        }
    }
}

fn context(services: &Services) -> WizardContext<'_, T1dFactory> {
    WizardContext {
        config: &services.config,
        factory: &services.factory,
        data: services.data.as_ref(),
    }
}

fn render_session(
    services: &Services,
    sessions: &mut Sessions,
    id: Uuid,
    transition: Option<Transition>,
    status: StatusCode,
) -> Response {
    let Some(session) = sessions.get(id) else {
        return unknown_session(id);
    };
    match session.view(&context(services)) {
        Ok(view) => json_response(
            status,
            SessionResponse {
                session_id: id,
                stage: session.stage(),
                transition,
                view,
            },
        ),
        Err(err) => {
            error!(session = %id, error = %err, "session view failed, session discarded");
            sessions.remove(id);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn unknown_session(id: Uuid) -> Response {
    error_response(StatusCode::NOT_FOUND, &format!("Unknown session {id}"))
}

fn status_for(err: &WizardError) -> StatusCode {
    match err {
        WizardError::Validation(_) => StatusCode::BAD_REQUEST,
        WizardError::DataNotFound { .. } | WizardError::PatientNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        WizardError::Data { .. }
        | WizardError::NoCheckpoint(_)
        | WizardError::EmptySeries
        | WizardError::ZeroMean => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    with_cache_control((status, Json(body)))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
