pub mod tiktok;

use crate::errors::ApiError;
use crate::types::{LiveStatus, RoomId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub use tiktok::TikTokApi;

/// Platform operations the session loop needs. Every failure is a typed
/// [`ApiError`] so the retry policy can decide without string matching.
pub trait LiveApi: Send + Sync {
    fn resolve_room_id(&self, user_id: &str) -> Result<RoomId, ApiError>;
    fn resolve_display_name(&self, room_id: &RoomId) -> Result<String, ApiError>;
    fn get_live_status(&self, room_id: &RoomId) -> Result<LiveStatus, ApiError>;
    fn get_stream_url(&self, room_id: &RoomId) -> Result<String, ApiError>;
    fn get_title(&self, room_id: &RoomId) -> Result<Option<String>, ApiError>;
}

#[derive(Default)]
struct FakeScript {
    rooms: VecDeque<Result<RoomId, ApiError>>,
    names: VecDeque<Result<String, ApiError>>,
    statuses: VecDeque<Result<LiveStatus, ApiError>>,
    urls: VecDeque<Result<String, ApiError>>,
    titles: VecDeque<Result<Option<String>, ApiError>>,
    calls: Vec<String>,
}

/// Scripted [`LiveApi`]. Each operation pops its own queue; an empty queue
/// falls back to a fixed answer (`room-1`, the user id, offline, a dummy URL,
/// no title).
#[derive(Default, Clone)]
pub struct FakeLiveApi {
    script: Arc<Mutex<FakeScript>>,
}

impl FakeLiveApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_room(&self, result: Result<RoomId, ApiError>) -> &Self {
        self.script.lock().expect("script lock").rooms.push_back(result);
        self
    }

    pub fn push_display_name(&self, result: Result<String, ApiError>) -> &Self {
        self.script.lock().expect("script lock").names.push_back(result);
        self
    }

    pub fn push_status(&self, result: Result<LiveStatus, ApiError>) -> &Self {
        self.script
            .lock()
            .expect("script lock")
            .statuses
            .push_back(result);
        self
    }

    pub fn push_statuses(&self, statuses: &[LiveStatus]) -> &Self {
        for status in statuses {
            self.push_status(Ok(*status));
        }
        self
    }

    pub fn push_stream_url(&self, result: Result<String, ApiError>) -> &Self {
        self.script.lock().expect("script lock").urls.push_back(result);
        self
    }

    pub fn push_title(&self, result: Result<Option<String>, ApiError>) -> &Self {
        self.script.lock().expect("script lock").titles.push_back(result);
        self
    }

    /// Calls in order, as `operation:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().expect("script lock").calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }
}

impl LiveApi for FakeLiveApi {
    fn resolve_room_id(&self, user_id: &str) -> Result<RoomId, ApiError> {
        let mut script = self.script.lock().expect("script lock");
        script.calls.push(format!("resolve_room_id:{user_id}"));
        script
            .rooms
            .pop_front()
            .unwrap_or_else(|| Ok(RoomId::new("room-1")))
    }

    fn resolve_display_name(&self, room_id: &RoomId) -> Result<String, ApiError> {
        let mut script = self.script.lock().expect("script lock");
        script.calls.push(format!("resolve_display_name:{room_id}"));
        script
            .names
            .pop_front()
            .unwrap_or_else(|| Ok(format!("owner-of-{room_id}")))
    }

    fn get_live_status(&self, room_id: &RoomId) -> Result<LiveStatus, ApiError> {
        let mut script = self.script.lock().expect("script lock");
        script.calls.push(format!("get_live_status:{room_id}"));
        script
            .statuses
            .pop_front()
            .unwrap_or(Ok(LiveStatus::Offline))
    }

    fn get_stream_url(&self, room_id: &RoomId) -> Result<String, ApiError> {
        let mut script = self.script.lock().expect("script lock");
        script.calls.push(format!("get_stream_url:{room_id}"));
        script
            .urls
            .pop_front()
            .unwrap_or_else(|| Ok(format!("https://pull.example.invalid/{room_id}.flv")))
    }

    fn get_title(&self, room_id: &RoomId) -> Result<Option<String>, ApiError> {
        let mut script = self.script.lock().expect("script lock");
        script.calls.push(format!("get_title:{room_id}"));
        script.titles.pop_front().unwrap_or(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::{FakeLiveApi, LiveApi};
    use crate::errors::ApiError;
    use crate::types::{LiveStatus, RoomId};

    #[test]
    fn fake_api_pops_scripted_answers_then_falls_back() {
        let api = FakeLiveApi::new();
        api.push_statuses(&[LiveStatus::Live])
            .push_status(Err(ApiError::Transient("timeout".into())));

        let room = RoomId::new("42");
        assert_eq!(api.get_live_status(&room), Ok(LiveStatus::Live));
        assert!(api.get_live_status(&room).is_err());
        assert_eq!(api.get_live_status(&room), Ok(LiveStatus::Offline));
        assert_eq!(api.count_calls("get_live_status"), 3);
        assert_eq!(api.calls()[0], "get_live_status:42");
    }
}
