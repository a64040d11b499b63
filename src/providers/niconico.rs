use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{Description, Provider, cache_file_path, discard, publish, staging_path};
use crate::config::NiconicoConfig;
use crate::error::{Error, Result};

pub const KEY: &str = "niconico";

const USER_AGENT: &str = "NicoBox/1011411.280464951 CFNetwork/1121.2.2 Darwin/19.3.0";
const DMC_USER_AGENT: &str = "NicoBox/4.6.0 (iPhone; iOS 13.3.1; Scale/2.00)";
const FRONTEND_ID: &str = "76";
const FRONTEND_VERSION: &str = "4.6.0";

static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:https?://(?:nico\.ms|.+?\.nicovideo\.jp/watch)/)?((?:[sn]m|so)[0-9]+)")
        .expect("valid regex")
});

/// Query parameters for the guest watch API, taken from the trial-play `watch` block
const GUEST_WATCH_PARAMS: &[(&str, &str)] = &[
    ("ver", "ver"),
    ("service_user_id", "serviceUserId"),
    ("frontend_id", "frontendId"),
    ("frontend_version", "frontendVersion"),
    ("signature", "signature"),
    ("audios", "audios"),
    ("protocols", "protocols"),
    ("heartbeat_lifetime", "heartbeatLifetime"),
    ("content_key_timeout", "contentKeyTimeout"),
    ("transfer_presets", "transferPresets"),
];

/// Niconico videos, fetched as audio through the guest trial-play flow
pub struct NiconicoProvider {
    cache_dir: PathBuf,
    public_api: String,
    www: String,
    dmc: String,
    ce_api: String,
    client: Client,
}

impl NiconicoProvider {
    pub fn new(config: &NiconicoConfig, cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            public_api: trim_base(&config.public_api),
            www: trim_base(&config.www),
            dmc: trim_base(&config.dmc),
            ce_api: trim_base(&config.ce_api),
            client: Client::new(),
        }
    }

    async fn trial_play(&self, id: &str) -> Result<Value> {
        let url = format!("{}/v1/ceweb/videos/{}/trial-play.json", self.public_api, id);
        debug!(id, "requesting trial play");
        let info = send_json(
            self.client
                .get(url)
                .header("User-Agent", USER_AGENT)
                .header("X-Frontend-Id", FRONTEND_ID)
                .header("X-Frontend-Version", FRONTEND_VERSION),
        )
        .await?;

        if let Some(code) = info.get("errorCode").filter(|c| !c.is_null()) {
            warn!(id, response = %info, "trial play refused");
            return Err(Error::Provider(format!(
                "niconico.trialPlay: {} (code: {})",
                text(&info["errorMessage"]),
                text(code)
            )));
        }
        Ok(info)
    }

    /// Exchange the trial-play watch parameters for a DMC session template
    async fn guest_watch(&self, watch: &Value) -> Result<Value> {
        let watch_id = text(field(watch, "/id")?);
        let mut query: Vec<(&str, String)> = GUEST_WATCH_PARAMS
            .iter()
            .map(|(name, key)| (*name, text(&watch[*key])))
            .collect();
        query.extend([
            ("action_track_id", action_track_id()),
            ("_format", "json".to_string()),
            ("increment_view_counter", "false".to_string()),
            ("is_https", "true".to_string()),
        ]);

        let url = format!("{}/api/guest_watch/{}", self.www, watch_id);
        debug!(%watch_id, "requesting guest watch");
        let res = send_json(
            self.client
                .get(url)
                .query(&query)
                .header("User-Agent", USER_AGENT),
        )
        .await?;

        if let Some(code) = res.pointer("/meta/error-code").filter(|c| !c.is_null()) {
            warn!(%watch_id, response = %res, "guest watch refused");
            return Err(Error::Provider(format!(
                "niconico.guestWatchApi: {} (code: {})",
                text(&res["meta"]["error-message"]),
                text(code)
            )));
        }
        Ok(field(&res, "/data/session_api")?.clone())
    }

    async fn create_session(&self, session_api: &Value, content_id: &Value) -> Result<Value> {
        let params = dmc_session_params(session_api, content_id)?;
        let url = format!("{}/api/sessions?_format=json", self.dmc);
        debug!("creating dmc session");
        let res = send_json(
            self.client
                .post(url)
                .header("User-Agent", DMC_USER_AGENT)
                .json(&params),
        )
        .await?;

        let status = res.pointer("/meta/status").and_then(Value::as_u64).unwrap_or(0);
        if status >= 400 {
            warn!(status, meta = %res["meta"], "dmc session not created");
            return Err(Error::Provider(format!(
                "niconico.dmcCreate: {} (status: {})",
                text(&res["meta"]["message"]),
                status
            )));
        }
        Ok(field(&res, "/data")?.clone())
    }

    async fn end_session(&self, session: &Value) -> Result<()> {
        let session_id = text(field(session, "/session/id")?);
        let url = format!("{}/api/sessions/{}?_format=json", self.dmc, session_id);
        debug!(%session_id, "ending dmc session");
        let res = send_json(
            self.client
                .delete(url)
                .header("User-Agent", DMC_USER_AGENT)
                .json(session),
        )
        .await?;

        let status = res.pointer("/meta/status").and_then(Value::as_u64).unwrap_or(0);
        if status >= 400 {
            warn!(%session_id, status, meta = %res["meta"], "dmc session not ended");
            return Err(Error::Provider(format!(
                "niconico.dmcEnd(maybe timeout?): {} (status: {})",
                text(&res["meta"]["message"]),
                status
            )));
        }
        Ok(())
    }

    /// Stream the session's content into `dest`
    async fn fetch_content(&self, content_uri: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(content_uri)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn fetch(&self, id: &str, staging: &Path) -> Result<()> {
        let info = self.trial_play(id).await?;
        let session_api = self.guest_watch(field(&info, "/watch")?).await?;
        let session = self
            .create_session(&session_api, field(&info, "/availableOutput/id")?)
            .await?;

        let content_uri = text(field(&session, "/session/content_uri")?);
        let bytes = self.fetch_content(&content_uri, staging).await?;
        debug!(id, bytes, "content downloaded");

        self.end_session(&session).await
    }
}

#[async_trait]
impl Provider for NiconicoProvider {
    fn key(&self) -> &str {
        KEY
    }

    fn test(&self, text: &str) -> Option<String> {
        VIDEO_ID
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn cache_path(&self, id: &str) -> PathBuf {
        cache_file_path(&self.cache_dir, KEY, id, "m4a")
    }

    fn url_from_id(&self, id: &str) -> String {
        format!("https://nico.ms/{}", id)
    }

    async fn download(&self, id: &str) -> Result<PathBuf> {
        let path = self.cache_path(id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }

        info!(id, "downloading from niconico");
        let staging = staging_path(&path);
        if let Err(e) = self.fetch(id, &staging).await {
            discard(&staging).await;
            return Err(e);
        }
        publish(&staging, &path).await?;

        info!(id, "niconico download complete");
        Ok(path)
    }

    async fn describe(&self, id: &str) -> Result<Description> {
        let url = format!("{}/nicoapi/v1/video.info", self.ce_api);
        let res = send_json(
            self.client
                .get(url)
                .query(&[("v", id), ("__format", "json")]),
        )
        .await?;
        let info = field(&res, "/nicovideo_video_response")?;

        if info["@status"].as_str() != Some("ok") {
            warn!(id, response = %info, "video info refused");
            return Err(Error::Provider(format!(
                "niconico.videoInfo: {} (code: {})",
                text(&info["error"]["description"]),
                text(&info["error"]["code"])
            )));
        }
        let video = &info["video"];

        let mut thumbnail = text(&video["thumbnail_url"]);
        if let Some(rest) = thumbnail.strip_prefix("http:") {
            thumbnail = format!("https:{}", rest);
        }
        if video["options"]["@large_thumbnail"].as_str() == Some("1") {
            thumbnail.push_str(".M");
        }

        let mut description = text(&video["description"]);
        if let Some(genre) = video["genre"].as_object()
            && genre.get("key").and_then(Value::as_str) != Some("none")
        {
            let label = genre.get("label").map(text).unwrap_or_default();
            description = format!("[{}] {}", label, description);
        }

        Ok(Description {
            title: text(&video["title"]),
            description: Some(description),
            url: Some(self.url_from_id(id)),
            thumbnail_url: (!thumbnail.is_empty()).then_some(thumbnail),
            fields: vec![(
                "Add to mylist".to_string(),
                format!("https://www.nicovideo.jp/mylist_add/video/{}", id),
            )],
            footer: "Niconico".to_string(),
            is_error: false,
        })
    }
}

/// Body for `POST /api/sessions`, built from the guest watch session template
fn dmc_session_params(session_api: &Value, content_id: &Value) -> Result<Value> {
    let audios = field(session_api, "/audios")?
        .as_array()
        .ok_or_else(|| Error::InvalidResponse("session_api.audios is not a list".to_string()))?;
    let src_id_sets: Vec<Value> = audios
        .iter()
        .map(|a| json!({ "content_src_ids": [a] }))
        .collect();

    Ok(json!({
        "session": {
            "client_info": {
                "player_id": session_api["player_id"],
                "remote_ip": "",
                "tracking_info": "",
            },
            "content_auth": {
                "auth_type": session_api["auth_types"]["http"],
                "content_key_timeout": session_api["content_key_timeout"],
                "service_id": "nicovideo",
                "service_user_id": session_api["service_user_id"],
            },
            "content_id": content_id,
            "content_src_id_sets": src_id_sets,
            "content_type": "audio",
            "keep_method": {
                "heartbeat": { "lifetime": session_api["heartbeat_lifetime"] },
            },
            "priority": session_api["priority"],
            "protocol": {
                "name": "http",
                "parameters": {
                    "http_parameters": {
                        "method": "GET",
                        "parameters": {
                            "http_output_download_parameters": {
                                "file_extension": "mp4",
                                "transfer_preset": session_api["transfer_presets"][0],
                                "use_ssl": "yes",
                            },
                        },
                    },
                },
            },
            "recipe_id": session_api["recipe_id"],
            "session_operation_auth": {
                "session_operation_auth_by_signature": {
                    "signature": session_api["signature"],
                    "token": session_api["token"],
                },
            },
            "timing_constraint": "unlimited",
        }
    }))
}

async fn send_json(request: RequestBuilder) -> Result<Value> {
    let response = request.send().await?;
    let status = response.status();
    response
        .json::<Value>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("expected json (status {}): {}", status, e)))
}

fn field<'a>(value: &'a Value, pointer: &str) -> Result<&'a Value> {
    value
        .pointer(pointer)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::InvalidResponse(format!("missing {}", pointer)))
}

/// Render a json value the way it goes into a query string or message:
/// strings bare, lists comma-joined
fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn action_track_id() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}_{}", token, millis)
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> NiconicoProvider {
        NiconicoProvider::new(&NiconicoConfig::default(), Path::new("/cache"))
    }

    #[test]
    fn test_extracts_ids() {
        let p = provider();
        assert_eq!(p.test("sm9").as_deref(), Some("sm9"));
        assert_eq!(
            p.test("https://www.nicovideo.jp/watch/so12345").as_deref(),
            Some("so12345")
        );
        assert_eq!(p.test("https://sp.nicovideo.jp/watch/nm777?ref=x").as_deref(), Some("nm777"));
        assert_eq!(p.test("https://nico.ms/sm42").as_deref(), Some("sm42"));
        assert_eq!(p.test("lv12345"), None);
        assert_eq!(p.test("hello"), None);
    }

    #[test]
    fn test_paths_and_urls() {
        let p = provider();
        assert_eq!(p.cache_path("sm9"), PathBuf::from("/cache/niconico:sm9.m4a"));
        assert_eq!(p.url_from_id("sm9"), "https://nico.ms/sm9");
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(text(&json!("abc")), "abc");
        assert_eq!(text(&json!(120)), "120");
        assert_eq!(text(&json!(["a", "b"])), "a,b");
        assert_eq!(text(&Value::Null), "");
    }

    #[test]
    fn test_action_track_id_shape() {
        let id = action_track_id();
        let (token, millis) = id.split_once('_').unwrap();
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(millis.parse::<u128>().is_ok());
    }

    #[test]
    fn test_session_params_from_template() {
        let template = json!({
            "player_id": "p1",
            "auth_types": { "http": "ht2" },
            "content_key_timeout": 600000,
            "service_user_id": "u1",
            "audios": ["archive_aac_64kbps", "archive_aac_128kbps"],
            "heartbeat_lifetime": 120000,
            "priority": 0.8,
            "transfer_presets": ["preset_a"],
            "recipe_id": "nicovideo-sm9",
            "signature": "sig",
            "token": "tok",
        });
        let params = dmc_session_params(&template, &json!("out_1")).unwrap();
        let session = &params["session"];
        assert_eq!(session["content_id"], "out_1");
        assert_eq!(session["content_auth"]["auth_type"], "ht2");
        assert_eq!(
            session["content_src_id_sets"][1]["content_src_ids"][0],
            "archive_aac_128kbps"
        );
        assert_eq!(
            session["protocol"]["parameters"]["http_parameters"]["parameters"]
                ["http_output_download_parameters"]["transfer_preset"],
            "preset_a"
        );

        assert!(matches!(
            dmc_session_params(&json!({}), &json!("out_1")),
            Err(Error::InvalidResponse(_))
        ));
    }
}
