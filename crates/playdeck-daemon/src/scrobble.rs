//! Signed audioscrobbler client.
//!
//! Implements the Last.fm-style request signature: md5 over the
//! alphabetically ordered `key||value` concatenation with the shared secret
//! appended (`format`/`callback` excluded from signing).  The player core
//! only hands this module track metadata; it never signs requests itself.

use tracing::{debug, warn};

use playdeck_proto::config::ScrobbleConfig;
use playdeck_proto::protocol::TrackEntry;

const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";

pub struct Scrobbler {
    api_key: String,
    api_secret: String,
    session_key: String,
    client: reqwest::Client,
}

impl Scrobbler {
    /// None when scrobbling is disabled or the credentials are incomplete.
    pub fn from_config(config: &ScrobbleConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.api_key.is_empty()
            || config.api_secret.is_empty()
            || config.session_key.is_empty()
        {
            warn!("scrobbling enabled but credentials are incomplete, disabling");
            return None;
        }
        Some(Self {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            session_key: config.session_key.clone(),
            client: reqwest::Client::new(),
        })
    }

    pub async fn update_now_playing(&self, track: &TrackEntry) -> anyhow::Result<()> {
        let mut params = vec![
            ("method".to_string(), "track.updateNowPlaying".to_string()),
            ("track".to_string(), track.title.clone()),
            ("artist".to_string(), track.artist.clone()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), self.session_key.clone()),
        ];
        if !track.album.is_empty() {
            params.push(("album".to_string(), track.album.clone()));
        }
        self.call(params).await
    }

    /// `started_at_secs`: unix timestamp at which the track started playing.
    pub async fn scrobble(&self, track: &TrackEntry, started_at_secs: i64) -> anyhow::Result<()> {
        let mut params = vec![
            ("method".to_string(), "track.scrobble".to_string()),
            ("timestamp[0]".to_string(), started_at_secs.to_string()),
            ("track[0]".to_string(), track.title.clone()),
            ("artist[0]".to_string(), track.artist.clone()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), self.session_key.clone()),
        ];
        if !track.album.is_empty() {
            params.push(("album[0]".to_string(), track.album.clone()));
        }
        self.call(params).await
    }

    async fn call(&self, mut params: Vec<(String, String)>) -> anyhow::Result<()> {
        let signature = sign(&params, &self.api_secret);
        params.push(("api_sig".to_string(), signature));
        params.push(("format".to_string(), "json".to_string()));

        let response = self.client.post(API_URL).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("audioscrobbler call failed with status {}", status);
        }
        debug!("audioscrobbler call ok");
        Ok(())
    }
}

/// Computes the request signature.  Parameters are signed in alphabetical key
/// order; `format` and `callback` never participate.
fn sign(params: &[(String, String)], secret: &str) -> String {
    let mut pairs: Vec<&(String, String)> = params
        .iter()
        .filter(|(key, _)| key != "format" && key != "callback")
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut base = String::new();
    for (key, value) in pairs {
        base.push_str(key);
        base.push_str(value);
    }
    base.push_str(secret);

    format!("{:x}", md5::compute(base.as_bytes()))
}
