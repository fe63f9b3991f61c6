use actix_web::{HttpRequest, HttpResponse, web};
use actix_ws::Message;
use futures_util::StreamExt;

use crate::cli;
use crate::server::AppState;

pub const SCOPE_PATH: &str = "/__devserve";

pub fn build_scope() -> actix_web::Scope {
    web::scope(SCOPE_PATH)
        .route("/client.js", web::get().to(client_script))
        .route("/events", web::get().to(events))
}

async fn client_script() -> HttpResponse {
    HttpResponse::Ok()
        .append_header(("Cache-Control", "no-store, max-age=0"))
        .content_type("application/javascript")
        .body(include_str!("./js/client.js"))
}

/// Websocket feed of compiler events. Each connected browser gets its own
/// broadcast subscription; the page reloads itself on `reload` messages.
async fn events(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let mut rx = state.broadcaster.subscribe();

    let mut session_for_messages = session.clone();

    actix_web::rt::spawn(async move {
        while let Some(Ok(message)) = msg_stream.next().await {
            match message {
                Message::Ping(bytes) => {
                    if session_for_messages.pong(&bytes).await.is_err() {
                        break;
                    }
                }
                Message::Close(reason) => {
                    let _ = session_for_messages.close(reason).await;
                    break;
                }
                Message::Text(_)
                | Message::Binary(_)
                | Message::Continuation(_)
                | Message::Pong(_) => {}
                Message::Nop => {}
            }
        }
    });

    actix_web::rt::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if session.text(payload).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    cli::warn(&format!("failed to serialize compiler event: {error}"));
                }
            }
        }
    });

    Ok(response)
}
