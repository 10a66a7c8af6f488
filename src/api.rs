//! Handlers behind `/get`, `/set` and `/fade`.

use std::collections::HashSet;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::Serialize;
use tungstenite::http::header::{CONTENT_TYPE, HeaderValue};
use tungstenite::http::{Response, StatusCode};
use url::form_urlencoded;

use crate::error::ControlError;
use crate::store::ChannelStore;

#[derive(Debug, Serialize)]
struct ChannelsBody {
    target: Vec<String>,
    current: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FadeBody {
    speed: u16,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Vec<u8>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(bytes);
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("[HTTP] JSON serialization error: {}", e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn empty_response(status: StatusCode) -> Response<Vec<u8>> {
    let mut response = Response::new(Vec::new());
    *response.status_mut() = status;
    response
}

/// `GET /get`: every slot's target and current at public resolution, as
/// decimal strings.
pub fn get_channels(store: &ChannelStore) -> Response<Vec<u8>> {
    let snapshot = store.read_all();
    let body = ChannelsBody {
        target: snapshot.target.iter().map(u8::to_string).collect(),
        current: snapshot.current.iter().map(u8::to_string).collect(),
    };
    json_response(StatusCode::OK, &body)
}

/// Plain decimal digits only; `str::parse` would also take a leading `+`.
fn parse_number<T: FromStr>(what: &'static str, input: &str) -> Result<T, ControlError> {
    let malformed = || ControlError::Malformed {
        what,
        input: input.to_string(),
    };
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    input.parse().map_err(|_| malformed())
}

fn apply_pair(store: &ChannelStore, key: &str, value: &str) -> Result<u16, ControlError> {
    let channel = parse_number("channel", key)?;
    let value = parse_number("value", value)?;
    store.set_channel(channel, value)
}

/// `GET /set?<channel>=<value>&...`: every valid pair is applied, bad pairs
/// are logged and skipped. A repeated key only counts the first time.
/// Returns how many pairs were applied.
pub fn set_channels(store: &ChannelStore, query: Option<&str>) -> (Response<Vec<u8>>, usize) {
    let mut applied = 0;
    let mut seen = HashSet::new();
    for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        if !seen.insert(key.clone()) {
            debug!("[HTTP] ignoring repeated {}={}", key, value);
            continue;
        }
        match apply_pair(store, &key, &value) {
            Ok(slot) => {
                info!("[HTTP] set {} (slot {}) = {}", key, slot, value);
                applied += 1;
            }
            Err(e) => warn!("[HTTP] skipping {}={}: {}", key, value, e),
        }
    }
    (empty_response(StatusCode::OK), applied)
}

/// `GET /fade?speed=<n>`: update the fade speed when `speed` is given and
/// non-empty. Bad input answers 400 and leaves the speed alone. The body
/// always carries the speed in effect.
pub fn fade(store: &ChannelStore, query: Option<&str>) -> Response<Vec<u8>> {
    let requested = form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .find(|(key, _)| key == "speed")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty());

    let mut status = StatusCode::OK;
    if let Some(value) = requested {
        let result =
            parse_number::<u64>("speed", &value).and_then(|speed| store.set_fade_speed(speed));
        match result {
            Ok(()) => info!("[HTTP] fade speed set to {}", value),
            Err(e) => {
                warn!("[HTTP] rejecting fade speed: {}", e);
                status = StatusCode::BAD_REQUEST;
            }
        }
    }

    json_response(status, &FadeBody { speed: store.fade_speed() })
}
