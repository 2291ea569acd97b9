//! Incoming-call webhook.
//!
//! The telephony provider POSTs here when a call arrives; the TwiML reply greets
//! the caller and connects the call's audio to `/twilio/stream`.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::fmt::Write as _;
use tracing::{error, info};

use crate::config::TelephonyConfig;
use crate::state::AppState;

const FALLBACK_APOLOGY: &str = "We're sorry, the system is having a problem. Please call again in a moment.";
const FALLBACK_ADVICE: &str = "If the problem continues, please contact our customer center directly.";

/// Form fields of the call webhook. Only used for logging; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VoiceWebhook {
    pub call_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// `POST /twilio/voice`
///
/// Always answers 200 with TwiML: when no stream endpoint is configured the
/// caller hears an apology instead of a dropped call.
pub async fn twilio_voice(
    state: web::Data<AppState>,
    form: Option<web::Form<VoiceWebhook>>,
) -> HttpResponse {
    let call = form.map(web::Form::into_inner).unwrap_or_default();
    let config = state.get_config();

    let twiml = match state.stream_endpoint() {
        Some(endpoint) => {
            info!(call_sid = ?call.call_sid, from = ?call.from, to = ?call.to, "Incoming call, connecting media stream");
            connect_twiml(&config.telephony, endpoint)
        }
        None => {
            error!(call_sid = ?call.call_sid, "No telephony stream endpoint configured, answering with fallback");
            fallback_twiml(&config.telephony)
        }
    };

    HttpResponse::Ok().content_type("text/xml").body(twiml)
}

/// Greeting followed by a `<Connect><Stream>` to the bridge.
pub fn connect_twiml(telephony: &TelephonyConfig, stream_url: &str) -> String {
    let mut twiml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    push_say(&mut twiml, telephony, &telephony.greeting);
    let _ = write!(
        twiml,
        r#"<Connect><Stream url="{}"/></Connect></Response>"#,
        xml_escape(stream_url)
    );
    twiml
}

pub fn fallback_twiml(telephony: &TelephonyConfig) -> String {
    let mut twiml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    push_say(&mut twiml, telephony, FALLBACK_APOLOGY);
    twiml.push_str(r#"<Pause length="1"/>"#);
    push_say(&mut twiml, telephony, FALLBACK_ADVICE);
    twiml.push_str("</Response>");
    twiml
}

fn push_say(twiml: &mut String, telephony: &TelephonyConfig, text: &str) {
    let _ = write!(
        twiml,
        r#"<Say language="{}" voice="{}">{}</Say>"#,
        xml_escape(&telephony.greeting_language),
        xml_escape(&telephony.greeting_voice),
        xml_escape(text)
    );
}

/// Escape text for use in XML content and double-quoted attributes.
pub fn xml_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
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
