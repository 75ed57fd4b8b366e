use super::LiveApi;
use crate::config::ApiConfig;
use crate::errors::{ApiError, LiverecError};
use crate::logging::append_run_log;
use crate::types::{LiveStatus, RoomId};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

const REFERER_URL: &str = "https://www.tiktok.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const OFFLINE_ROOM_STATUS: i64 = 4;
const AGE_RESTRICTED_STATUS_CODE: i64 = 4003110;
const PRIVATE_ACCOUNT_PROMPT: &str = "This account is private";

/// Blocking TikTok web client. Redirects are never followed: a redirect on
/// the `/live` page is how the site answers blocked regions.
pub struct TikTokApi {
    client: Client,
    parsers: PageParsers,
}

impl TikTokApi {
    pub fn new(config: &ApiConfig) -> Result<Self, LiverecError> {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
        if let Some(cookies) = &config.cookies {
            let value = HeaderValue::from_str(cookies.trim())
                .map_err(|e| LiverecError::InvalidConfig(format!("api.cookies: {e}")))?;
            headers.insert(COOKIE, value);
        }

        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| LiverecError::InvalidConfig(format!("api.proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| LiverecError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            parsers: PageParsers::new()?,
        })
    }

    fn get_text(&self, url: &str) -> Result<(StatusCode, String), ApiError> {
        let response = self.client.get(url).send().map_err(map_transport_error)?;
        let status = response.status();
        let body = response.text().map_err(map_transport_error)?;
        Ok((status, body))
    }

    fn get_json(&self, url: &str) -> Result<Value, ApiError> {
        let response = self.client.get(url).send().map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Transient(format!("{url} answered {status}")));
        }
        response
            .json::<Value>()
            .map_err(|e| ApiError::Transient(format!("malformed response from {url}: {e}")))
    }

    fn room_detail(&self, room_id: &RoomId) -> Result<Value, ApiError> {
        self.get_json(&format!(
            "https://www.tiktok.com/api/live/detail/?aid=1988&roomID={room_id}"
        ))
    }

    fn room_info(&self, room_id: &RoomId) -> Result<Value, ApiError> {
        self.get_json(&format!(
            "https://webcast.tiktok.com/webcast/room/info/?aid=1988&room_id={room_id}"
        ))
    }
}

impl LiveApi for TikTokApi {
    fn resolve_room_id(&self, user_id: &str) -> Result<RoomId, ApiError> {
        let (status, body) = self.get_text(&format!("https://www.tiktok.com/@{user_id}"))?;
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(format!("user `{user_id}` does not exist")));
        }
        if status.is_success() {
            if let Some(room) = self.parsers.rehydration_room_id(&body) {
                return Ok(room);
            }
        }

        let (status, body) = self.get_text(&format!("https://www.tiktok.com/@{user_id}/live"))?;
        if status.is_redirection() {
            return Err(ApiError::Blacklisted(format!(
                "redirected while resolving `{user_id}`; the region may be blocked"
            )));
        }
        if !status.is_success() {
            return Err(ApiError::Transient(format!("live page answered {status}")));
        }
        self.parsers
            .room_marker(&body)
            .ok_or_else(|| ApiError::NotFound(format!("no room_id for `{user_id}`")))
    }

    fn resolve_display_name(&self, room_id: &RoomId) -> Result<String, ApiError> {
        let detail = self.room_detail(room_id)?;
        detail
            .pointer("/LiveRoomInfo/ownerInfo/uniqueId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                append_run_log("warn", "api.owner_missing", json!({ "room_id": room_id }));
                ApiError::NotFound(format!("no owner for room {room_id}"))
            })
    }

    fn get_live_status(&self, room_id: &RoomId) -> Result<LiveStatus, ApiError> {
        Ok(parse_live_status(&self.room_detail(room_id)?))
    }

    fn get_stream_url(&self, room_id: &RoomId) -> Result<String, ApiError> {
        parse_stream_url(&self.room_info(room_id)?)
    }

    fn get_title(&self, room_id: &RoomId) -> Result<Option<String>, ApiError> {
        let info = self.room_info(room_id)?;
        Ok(info
            .pointer("/data/title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string))
    }
}

fn map_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_connect() {
        ApiError::ConnectionClosed(err.to_string())
    } else {
        ApiError::Transient(err.to_string())
    }
}

struct PageParsers {
    room_marker: Regex,
    rehydration: Regex,
}

impl PageParsers {
    fn new() -> Result<Self, LiverecError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| LiverecError::InvalidConfig(e.to_string()))
        };
        Ok(Self {
            room_marker: compile(r"room_id=(\d+)")?,
            rehydration: compile(
                r#"(?s)<script[^>]*id="__UNIVERSAL_DATA_FOR_REHYDRATION__"[^>]*>(.*?)</script>"#,
            )?,
        })
    }

    fn room_marker(&self, body: &str) -> Option<RoomId> {
        self.room_marker
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| RoomId::new(m.as_str()))
    }

    fn rehydration_room_id(&self, body: &str) -> Option<RoomId> {
        let script = self.rehydration.captures(body)?.get(1)?.as_str();
        let data: Value = serde_json::from_str(script).ok()?;
        let room = data
            .get("__DEFAULT_SCOPE__")?
            .get("webapp.user-detail")?
            .pointer("/userInfo/user/roomId")?;
        let room = match room {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!room.is_empty()).then(|| RoomId::new(room))
    }
}

fn parse_live_status(detail: &Value) -> LiveStatus {
    match detail
        .pointer("/LiveRoomInfo/status")
        .and_then(Value::as_i64)
    {
        Some(OFFLINE_ROOM_STATUS) => LiveStatus::Offline,
        Some(_) => LiveStatus::Live,
        None => LiveStatus::Unknown,
    }
}

fn parse_stream_url(info: &Value) -> Result<String, ApiError> {
    let private = info
        .pointer("/data/prompts")
        .and_then(Value::as_str)
        .map(|prompts| prompts.contains(PRIVATE_ACCOUNT_PROMPT))
        .unwrap_or(false);
    if private {
        return Err(ApiError::LoginRequired("account is private".to_string()));
    }
    if info.get("status_code").and_then(Value::as_i64) == Some(AGE_RESTRICTED_STATUS_CODE) {
        return Err(ApiError::AgeRestricted("account is age restricted".to_string()));
    }
    info.pointer("/data/stream_url/rtmp_pull_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Transient("rtmp_pull_url missing from room info".to_string()))
}
