//! Telephony call webhook.
//!
//! The provider requests `/voice` when a call comes in and expects TwiML
//! back. The response greets the caller and connects the call audio to the
//! gateway's `/stream` route.

use crate::gateway::TELEPHONY_PATH;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::info;

/// GET|POST /voice
pub async fn voice_webhook(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let telephony = &state.config.telephony;
    let stream_url = if telephony.stream_url.is_empty() {
        format!("wss://{}{}", req.connection_info().host(), TELEPHONY_PATH)
    } else {
        telephony.stream_url.clone()
    };

    info!(stream_url = %stream_url, "answering incoming call");

    HttpResponse::Ok()
        .content_type("text/xml")
        .body(render_twiml(&telephony.greeting, &stream_url))
}

fn render_twiml(greeting: &str, stream_url: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<Response>",
            "<Say>{}</Say>",
            "<Connect>",
            r#"<Stream url="{}" />"#,
            "</Connect>",
            "</Response>"
        ),
        escape_xml(greeting),
        escape_xml(stream_url)
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
