use log::warn;
use std::future::{Ready, ready};
use std::sync::Arc;

use actix_web::dev::Payload;
use actix_web::{
    FromRequest, HttpRequest, HttpResponse, Resource, Responder, guard, http::Method, web,
};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::EdgeDetect;
use crate::edge::Level;
use crate::error::AppError;
use crate::gpio::{GpioBackend, GpioManager, GpioState, PinSettings, StateChangeEvent};

pub struct AppState<B: GpioBackend + ?Sized> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend + ?Sized> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct SettingsPayload {
    state: Option<GpioState>,
    edge: Option<EdgeDetect>,
    debounce_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<StateChangeEvent>,
    pin_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.is_none_or(|p| p == event.pin_id)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = AppError::Gpio(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Pin id taken from the `{pin_id}` path segment.
struct PinId(u32);

impl FromRequest for PinId {
    type Error = AppError;
    type Future = Ready<Result<Self, AppError>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let pin_id = req
            .match_info()
            .get("pin_id")
            .ok_or_else(|| AppError::InvalidValue("Missing pin id".into()))
            .and_then(|raw| {
                raw.parse::<u32>()
                    .map_err(|_| AppError::InvalidValue("Invalid pin id".into()))
            });
        ready(pin_id.map(PinId))
    }
}

/// A resource answering 405 to every method outside `allowed`.
fn resource(path: &str, allowed: &[Method]) -> Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(allowed))
            .to(method_not_allowed),
    )
}

pub fn api_scope<B: GpioBackend + ?Sized + 'static>(base_path: &str) -> actix_web::Scope {
    let get_only = |path| resource(path, &[Method::GET]);
    let get_post = |path| resource(path, &[Method::GET, Method::POST]);

    web::scope(base_path)
        .service(get_only("/gpios").route(web::get().to(list_gpios::<B>)))
        .service(get_only("/gpios/events").route(web::get().to(events_ws_all::<B>)))
        .service(get_only("/gpio/{pin_id}").route(web::get().to(pin_descriptor::<B>)))
        .service(get_only("/gpio/{pin_id}/info").route(web::get().to(pin_info::<B>)))
        .service(
            get_post("/gpio/{pin_id}/settings")
                .route(web::get().to(get_settings::<B>))
                .route(web::post().to(set_settings::<B>)),
        )
        .service(
            get_post("/gpio/{pin_id}/value")
                .route(web::get().to(get_value::<B>))
                .route(web::post().to(set_value::<B>)),
        )
        .service(get_only("/gpio/{pin_id}/event").route(web::get().to(last_event::<B>)))
        .service(get_only("/gpio/{pin_id}/events").route(web::get().to(event_history::<B>)))
        .service(get_only("/gpio/{pin_id}/events/ws").route(web::get().to(events_ws_pin::<B>)))
}

async fn list_gpios<B: GpioBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> impl Responder {
    web::Json(state.manager.list_pins().await)
}

async fn pin_descriptor<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_pin_descriptor(pin_id).await?))
}

async fn pin_info<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_pin_info(pin_id).await?))
}

async fn get_settings<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_pin_settings(pin_id).await?))
}

/// Partial update: absent fields keep their current value.
async fn set_settings<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let current = state.manager.get_pin_settings(pin_id).await?;
    let merged = parse_settings_payload(&body, current)?;

    state.manager.set_pin_settings(pin_id, &merged).await?;

    Ok(web::Json(merged))
}

async fn get_value<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let level = state.manager.read_value(pin_id).await?;

    Ok(web::Json(level.as_u8()))
}

async fn set_value<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let level = parse_value_payload(&body)?;

    state.manager.write_value(pin_id, level).await?;

    Ok(HttpResponse::Ok())
}

async fn last_event<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    Ok(match state.manager.get_last_event(pin_id).await? {
        Some(event) => HttpResponse::Ok().json(event),
        None => HttpResponse::Ok().finish(),
    })
}

async fn event_history<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_events(pin_id, query.limit).await?))
}

async fn events_ws_all<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_pin<B: GpioBackend + ?Sized + 'static>(
    PinId(pin_id): PinId,
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    state.manager.get_pin_info(pin_id).await?;

    open_event_websocket(&req, stream, &state, Some(pin_id))
}

fn open_event_websocket<B: GpioBackend + ?Sized + 'static>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    pin_filter: Option<u32>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, pin_filter).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<Level, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    let value = match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| AppError::InvalidValue("Value must be an integer".into()))?,
        _ => {
            return Err(AppError::InvalidValue(
                "Value payload must be valid UTF-8".into(),
            ));
        }
    };

    Level::from_u8(value)
}

fn parse_settings_payload(body: &[u8], current: PinSettings) -> Result<PinSettings, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty settings payload".into()));
    }

    let payload: SettingsPayload = serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid settings payload: {e}")))?;

    let mut merged = current;
    if let Some(state) = payload.state {
        merged.state = state;
    }
    if let Some(edge) = payload.edge {
        merged.edge = edge;
    }
    if let Some(debounce) = payload.debounce_ms {
        merged.debounce_ms = debounce;
    }
    Ok(merged)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
