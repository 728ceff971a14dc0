//! xSchedule API client implementation

use std::fmt;
use std::time::Duration;

use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::cache::QueryCache;
use crate::error::{DeviceError, DeviceResult};
use crate::models::{PlaylistStep, ScheduleInfo};

/// Query endpoint path
const QUERY_ENDPOINT: &str = "xScheduleQuery";

/// Command endpoint path
const COMMAND_ENDPOINT: &str = "xScheduleCommand";

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Encode set matching the device's expectations: everything outside the
/// URL-unreserved characters is percent-encoded, so a space is always `%20`.
/// The device does not understand `+` as a space.
const DEVICE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Commands that plausibly change playlist/step/schedule data on the device.
///
/// Every entry here is matched to a cache invalidation after the command is
/// issued; a playback-altering command missing from this list is a latent
/// staleness bug.
const PLAYBACK_AFFECTING_COMMANDS: &[&str] = &[
    "Play",
    "Play specified playlist",
    "Play playlist step",
    "Pause",
    "Stop",
    "Next step in current playlist",
    "Prior step in current playlist",
    "Restart step in current playlist",
    "Jump to specified step in current playlist at the end of current step",
    "Enqueue playlist step",
    "Clear playlist queue",
];

/// Check whether a command invalidates cached listings when issued.
///
/// Exposed so callers issuing commands over the push channel can apply the
/// same invalidation rule.
pub fn is_playback_affecting(command: &str) -> bool {
    PLAYBACK_AFFECTING_COMMANDS.contains(&command)
}

/// MD5 hex digest of the device credential.
///
/// The device never receives the credential in cleartext; this digest is
/// what goes into the `Pass` parameter on both the HTTP and push channels.
pub fn hash_credential(secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// How a command's success affects the cached listings
enum CacheScope<'a> {
    /// No cached data is affected
    Keep,
    /// Drop everything
    All,
    /// Drop the entries for one playlist
    Playlist(&'a str),
}

/// Client for the xSchedule query/command HTTP API
#[derive(Clone)]
pub struct XScheduleClient {
    http: Client,
    base_url: String,
    password_hash: Option<String>,
    cache: QueryCache,
}

impl fmt::Debug for XScheduleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XScheduleClient")
            .field("base_url", &self.base_url)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl XScheduleClient {
    /// Create a client for a device at `host:port`
    pub fn new(host: &str, port: u16, password: Option<&str>) -> DeviceResult<Self> {
        Self::from_url(&format!("http://{host}:{port}"), password)
    }

    /// Create a client from a full base URL (`http://host:port`)
    pub fn from_url(base_url: &str, password: Option<&str>) -> DeviceResult<Self> {
        // Validate early so a bad address fails at setup, not first request
        Url::parse(base_url)?;

        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            password_hash: password.filter(|p| !p.is_empty()).map(hash_credential),
            cache: QueryCache::new(),
        })
    }

    /// Execute a query against the device
    pub async fn query(&self, name: &str, parameters: Option<&str>) -> DeviceResult<Value> {
        debug!(query = name, ?parameters, "Executing query");
        self.request(QUERY_ENDPOINT, "Query", name, parameters).await
    }

    /// Execute a command against the device.
    ///
    /// Playback-affecting commands drop the entire listing cache; use the
    /// typed command methods for playlist-scoped invalidation.
    pub async fn command(&self, name: &str, parameters: Option<&str>) -> DeviceResult<Value> {
        let scope = if is_playback_affecting(name) {
            CacheScope::All
        } else {
            CacheScope::Keep
        };
        self.run_command(name, parameters, scope).await
    }

    async fn run_command(
        &self,
        name: &str,
        parameters: Option<&str>,
        scope: CacheScope<'_>,
    ) -> DeviceResult<Value> {
        debug!(command = name, ?parameters, "Executing command");
        let value = self
            .request(COMMAND_ENDPOINT, "Command", name, parameters)
            .await?;

        match scope {
            CacheScope::Keep => {}
            CacheScope::All => self.cache.invalidate_all(),
            CacheScope::Playlist(playlist) => self.cache.invalidate_playlist(playlist).await,
        }

        Ok(value)
    }

    /// Build the request URL by hand: the device requires `%20` for spaces
    /// (never `+`), including in the query/command name itself, so the
    /// query string cannot go through a form-urlencoded serializer.
    fn build_url(&self, endpoint: &str, action_key: &str, action: &str, parameters: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}?{}={}",
            self.base_url,
            endpoint,
            action_key,
            utf8_percent_encode(action, DEVICE_ENCODE_SET)
        );

        if let Some(parameters) = parameters.filter(|p| !p.is_empty()) {
            url.push_str("&Parameters=");
            url.push_str(&utf8_percent_encode(parameters, DEVICE_ENCODE_SET).to_string());
        }

        if let Some(hash) = &self.password_hash {
            url.push_str("&Pass=");
            url.push_str(hash);
        }

        url
    }

    async fn request(
        &self,
        endpoint: &str,
        action_key: &str,
        action: &str,
        parameters: Option<&str>,
    ) -> DeviceResult<Value> {
        let url = self.build_url(endpoint, action_key, action, parameters);

        let response = self.http.get(&url).send().await?;
        let response = response.error_for_status()?;
        let body = response.text().await?;

        let value: Value = serde_json::from_str(&body)?;

        // The device reports failures in-band with HTTP 200
        if value.get("result").and_then(Value::as_str) == Some("failed") {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if message.to_lowercase().contains("password") {
                return Err(DeviceError::Auth);
            }
            return Err(DeviceError::Rejected(message.to_string()));
        }

        Ok(value)
    }

    // Status and information queries

    /// Get the current playing status. Never cached.
    pub async fn playing_status(&self) -> DeviceResult<Value> {
        self.query("GetPlayingStatus", None).await
    }

    /// Get the names of all playlists on the device
    pub async fn playlists(&self, force_refresh: bool) -> DeviceResult<Vec<String>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_playlists().await {
                return Ok(cached);
            }
        }

        let value = self.query("GetPlayLists", None).await?;
        let playlists = parse_playlist_names(&value);
        self.cache.put_playlists(playlists.clone()).await;
        Ok(playlists)
    }

    /// Get the steps (songs) of a playlist
    pub async fn playlist_steps(
        &self,
        playlist: &str,
        force_refresh: bool,
    ) -> DeviceResult<Vec<PlaylistStep>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_steps(playlist).await {
                return Ok(cached);
            }
        }

        let value = self.query("GetPlayListSteps", Some(playlist)).await?;
        let steps = parse_listing::<PlaylistStep>(&value, "steps");
        self.cache.put_steps(playlist.to_string(), steps.clone()).await;
        Ok(steps)
    }

    /// Get the schedules attached to a playlist
    pub async fn playlist_schedules(
        &self,
        playlist: &str,
        force_refresh: bool,
    ) -> DeviceResult<Vec<ScheduleInfo>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_schedules(playlist).await {
                return Ok(cached);
            }
        }

        let value = self.query("GetPlayListSchedules", Some(playlist)).await?;
        let schedules = parse_listing::<ScheduleInfo>(&value, "schedules");
        self.cache
            .put_schedules(playlist.to_string(), schedules.clone())
            .await;
        Ok(schedules)
    }

    /// Get the device-side queued steps. Never cached; the queue changes
    /// with every enqueue and song transition.
    pub async fn queued_steps(&self) -> DeviceResult<Vec<PlaylistStep>> {
        let value = self.query("GetQueuedSteps", None).await?;
        Ok(parse_listing::<PlaylistStep>(&value, "steps"))
    }

    /// Check that the device is reachable and the credential is accepted
    pub async fn verify_connection(&self) -> DeviceResult<()> {
        self.playing_status().await.map(|_| ())
    }

    // Playback control commands

    /// Resume playback
    pub async fn play(&self) -> DeviceResult<Value> {
        self.run_command("Play", None, CacheScope::All).await
    }

    /// Play the named playlist from the start
    pub async fn play_playlist(&self, playlist: &str) -> DeviceResult<Value> {
        self.run_command("Play specified playlist", Some(playlist), CacheScope::Playlist(playlist))
            .await
    }

    /// Play a specific step of a playlist
    pub async fn play_playlist_step(&self, playlist: &str, step: &str) -> DeviceResult<Value> {
        let parameters = format!("{playlist},{step}");
        self.run_command("Play playlist step", Some(&parameters), CacheScope::Playlist(playlist))
            .await
    }

    /// Pause playback
    pub async fn pause(&self) -> DeviceResult<Value> {
        self.run_command("Pause", None, CacheScope::All).await
    }

    /// Stop playback
    pub async fn stop(&self) -> DeviceResult<Value> {
        self.run_command("Stop", None, CacheScope::All).await
    }

    /// Advance to the next step in the current playlist
    pub async fn next_step(&self) -> DeviceResult<Value> {
        self.run_command("Next step in current playlist", None, CacheScope::All)
            .await
    }

    /// Go back to the previous step in the current playlist
    pub async fn previous_step(&self) -> DeviceResult<Value> {
        self.run_command("Prior step in current playlist", None, CacheScope::All)
            .await
    }

    /// Restart the current step
    pub async fn restart_step(&self) -> DeviceResult<Value> {
        self.run_command("Restart step in current playlist", None, CacheScope::All)
            .await
    }

    /// Redirect playback to the named step once the current step finishes
    pub async fn jump_to_step_at_end(&self, step: &str) -> DeviceResult<Value> {
        self.run_command(
            "Jump to specified step in current playlist at the end of current step",
            Some(step),
            CacheScope::All,
        )
        .await
    }

    /// Seek within the current step
    pub async fn set_step_position_ms(&self, position_ms: u64) -> DeviceResult<Value> {
        self.run_command("Set step position ms", Some(&position_ms.to_string()), CacheScope::Keep)
            .await
    }

    // Volume control commands

    /// Set the volume (0-100)
    pub async fn set_volume(&self, volume: u8) -> DeviceResult<Value> {
        self.run_command("Set volume to", Some(&volume.to_string()), CacheScope::Keep)
            .await
    }

    /// Adjust the volume by a relative amount (-100 to 100)
    pub async fn adjust_volume(&self, adjustment: i8) -> DeviceResult<Value> {
        self.run_command("Adjust volume by", Some(&adjustment.to_string()), CacheScope::Keep)
            .await
    }

    /// Toggle mute (the device has no absolute mute command)
    pub async fn toggle_mute(&self) -> DeviceResult<Value> {
        self.run_command("Toggle mute", None, CacheScope::Keep).await
    }

    // Queue commands

    /// Append a step to the device-side FIFO queue
    pub async fn enqueue_step(&self, playlist: &str, step: &str) -> DeviceResult<Value> {
        let parameters = format!("{playlist},{step}");
        self.run_command("Enqueue playlist step", Some(&parameters), CacheScope::Playlist(playlist))
            .await
    }

    /// Clear the device-side queue
    pub async fn clear_queue(&self) -> DeviceResult<Value> {
        self.run_command("Clear playlist queue", None, CacheScope::All)
            .await
    }

    // Cache control

    /// Drop cached listings: one playlist's entries, or everything
    pub async fn invalidate_cache(&self, playlist: Option<&str>) {
        match playlist {
            Some(playlist) => self.cache.invalidate_playlist(playlist).await,
            None => self.cache.invalidate_all(),
        }
    }
}

/// Extract playlist names from a `GetPlayLists` response; entries may be
/// objects carrying a `name` or bare strings depending on device version.
fn parse_playlist_names(value: &Value) -> Vec<String> {
    let Some(entries) = value.get("playlists").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.clone()),
            Value::Object(fields) => fields
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Extract a typed listing from a response, tolerating missing keys and
/// malformed entries (dropped, never an error)
fn parse_listing<T: serde::de::DeserializeOwned>(value: &Value, key: &str) -> Vec<T> {
    let Some(entries) = value.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> XScheduleClient {
        XScheduleClient::from_url(&server.uri(), None).unwrap()
    }

    async fn received_query_strings(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.query().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_hash_credential_is_md5_hex() {
        assert_eq!(
            hash_credential("password"),
            "5f4dcc3b5aa765d61d8327deb882cf99"
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        let result = XScheduleClient::from_url("not a url", None);
        assert_matches!(result, Err(DeviceError::Address(_)));
    }

    #[test]
    fn test_debug_redacts_password_hash() {
        let client = XScheduleClient::new("localhost", 80, Some("secret")).unwrap();
        let debug_str = format!("{client:?}");
        assert!(!debug_str.contains(&hash_credential("secret")));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_playback_affecting_classification() {
        assert!(is_playback_affecting("Stop"));
        assert!(is_playback_affecting("Play specified playlist"));
        assert!(is_playback_affecting("Enqueue playlist step"));
        assert!(!is_playback_affecting("Set volume to"));
        assert!(!is_playback_affecting("Toggle mute"));
    }

    #[tokio::test]
    async fn test_spaces_encode_as_percent20_never_plus() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .command("Play playlist step", Some("Big Show,Light Em Up"))
            .await
            .unwrap();

        let queries = received_query_strings(&server).await;
        let query = &queries[0];
        assert!(query.contains("Command=Play%20playlist%20step"), "{query}");
        assert!(query.contains("Parameters=Big%20Show%2CLight%20Em%20Up"), "{query}");
        assert!(!query.contains('+'), "{query}");
    }

    #[tokio::test]
    async fn test_password_hash_attached_to_every_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = XScheduleClient::from_url(&server.uri(), Some("secret")).unwrap();
        client.playing_status().await.unwrap();

        let queries = received_query_strings(&server).await;
        assert!(
            queries[0].contains("Pass=5ebe2294ecd0e0f08eab7690d2a6ee69"),
            "{}",
            queries[0]
        );
    }

    #[tokio::test]
    async fn test_password_related_failure_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "failed",
                "message": "Incorrect password"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.playing_status().await;
        assert_matches!(result, Err(DeviceError::Auth));
    }

    #[tokio::test]
    async fn test_other_failure_is_rejected_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "failed",
                "message": "Playlist not found"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.play_playlist("Nope").await;
        assert_matches!(result, Err(DeviceError::Rejected(message)) if message == "Playlist not found");
    }

    #[tokio::test]
    async fn test_unreachable_device_is_connection_error() {
        // Nothing listens on port 9; connect fails fast
        let client = XScheduleClient::from_url("http://127.0.0.1:9", None).unwrap();
        let result = client.playing_status().await;
        assert_matches!(result, Err(DeviceError::Connection(_)));
    }

    #[tokio::test]
    async fn test_extra_response_fields_do_not_break_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "idle",
                "somenewfield": {"nested": true}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let status = client.playing_status().await.unwrap();
        assert_eq!(status.get("status").and_then(Value::as_str), Some("idle"));
    }

    #[tokio::test]
    async fn test_playlist_names_parse_objects_and_strings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "playlists": [{"name": "Halloween", "id": "1"}, "Christmas"]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let playlists = client.playlists(false).await.unwrap();
        assert_eq!(playlists, vec!["Halloween", "Christmas"]);
    }

    #[tokio::test]
    async fn test_playlist_steps_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "Intro", "id": "1", "lengthms": "1000"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let first = client.playlist_steps("Halloween", false).await.unwrap();
        let second = client.playlist_steps("Halloween", false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].duration_ms(), 1000);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_and_overwrites_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "Old", "id": "1"}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "New", "id": "1"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);

        let first = client.playlist_steps("Halloween", false).await.unwrap();
        assert_eq!(first[0].name, "Old");

        let refreshed = client.playlist_steps("Halloween", true).await.unwrap();
        assert_eq!(refreshed[0].name, "New");

        // The forced fetch overwrote the cache entry
        let cached = client.playlist_steps("Halloween", false).await.unwrap();
        assert_eq!(cached[0].name, "New");
    }

    #[tokio::test]
    async fn test_playback_affecting_command_invalidates_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "Intro", "id": "1"}]
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xScheduleCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
            .mount(&server)
            .await;

        let client = client_for(&server);

        client.playlist_steps("Halloween", false).await.unwrap();
        client.stop().await.unwrap();

        // Invalidation happened before this read, so it goes to the device
        client.playlist_steps("Halloween", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_command_leaves_cache_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "Intro", "id": "1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xScheduleCommand"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
            .mount(&server)
            .await;

        let client = client_for(&server);

        client.playlist_steps("Halloween", false).await.unwrap();
        client.set_volume(40).await.unwrap();
        client.playlist_steps("Halloween", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_invalidation_is_scoped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xScheduleQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "steps": [{"name": "Intro", "id": "1"}]
            })))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);

        client.playlist_steps("Halloween", false).await.unwrap();
        client.playlist_steps("Christmas", false).await.unwrap();

        client.invalidate_cache(Some("Halloween")).await;

        // Halloween refetches, Christmas is still cached
        client.playlist_steps("Halloween", false).await.unwrap();
        client.playlist_steps("Christmas", false).await.unwrap();
    }
}
