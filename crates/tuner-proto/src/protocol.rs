use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bulk station list on the registry node.
pub const STATIONS_PATH: &str = "/api/v1/stations";
/// Registry live feed (server-sent events).
pub const REGISTRY_EVENTS_PATH: &str = "/api/v1/events";
/// Now-playing live feed, served from the origin of a station's stream URL.
pub const NOW_EVENTS_PATH: &str = "/api/v1/now/events";

/// Number of bands in a spectrum level vector.
pub const LEVEL_BANDS: usize = 16;

/// A tunable entry in the registry.  Identity is `station_id`, never the
/// position in the list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    pub station_id: String,
    pub name: String,
    pub frequency: Frequency,
    pub stream_url: String,
}

/// Display frequency.  The registry node serialises decimals as strings to
/// keep precision, older nodes send plain numbers; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Frequency {
    Number(f64),
    Text(String),
}

impl Frequency {
    /// Parsed value for display, `None` when the text is not a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Frequency::Number(n) => Some(*n),
            Frequency::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Normalised label: trailing zeros trimmed, `-0` collapsed to `0`.
    pub fn label(&self) -> String {
        let mut s = match self {
            Frequency::Number(n) => n.to_string(),
            Frequency::Text(s) => s.trim().to_string(),
        };
        if s.contains('.') {
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        if s == "-0" {
            s = "0".to_string();
        }
        s
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Frequency::Number(0.0)
    }
}

/// One message on the registry feed: `{ "event": "upsert"|"delete", "assignment": Station }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "assignment", rename_all = "lowercase")]
pub enum RegistryEvent {
    Upsert(Station),
    Delete(Station),
}

impl RegistryEvent {
    pub fn station(&self) -> &Station {
        match self {
            RegistryEvent::Upsert(s) | RegistryEvent::Delete(s) => s,
        }
    }
}

/// Track metadata pushed by a station's now-playing feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NowPlaying {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NowPlaying {
    /// `"artist - title [album]"`, falling back to `fallback` (usually the
    /// station name) when neither artist nor title is known.
    pub fn summary(&self, fallback: &str) -> String {
        let parts: Vec<&str> = [self.artist.as_deref(), self.title.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        let mut line = if parts.is_empty() {
            fallback.to_string()
        } else {
            parts.join(" - ")
        };
        if let Some(album) = self.album.as_deref().filter(|a| !a.trim().is_empty()) {
            line.push_str(&format!(" [{}]", album));
        }
        line
    }
}

/// Playback state machine.  Volume lives beside it, never inside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    /// Play requested, waiting for the device to confirm the source.
    Starting,
    Playing,
}

impl PlaybackState {
    pub fn is_playing(self) -> bool {
        self == PlaybackState::Playing
    }

    /// Playing or on the way there.
    pub fn is_active(self) -> bool {
        self != PlaybackState::Stopped
    }
}

/// Fixed-size spectrum level vector, every entry in `[0, 1]`.
pub type AudioLevels = [f32; LEVEL_BANDS];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_accepts_number_and_string() {
        let s: Station = serde_json::from_str(
            r#"{"station_id":"a","name":"A","frequency":"98.70","stream_url":"http://h/s"}"#,
        )
        .unwrap();
        assert_eq!(s.frequency.as_f64(), Some(98.7));
        assert_eq!(s.frequency.label(), "98.7");

        let s: Station = serde_json::from_str(
            r#"{"station_id":"b","name":"B","frequency":101.1,"stream_url":"http://h/s"}"#,
        )
        .unwrap();
        assert_eq!(s.frequency.as_f64(), Some(101.1));
    }

    #[test]
    fn test_frequency_label_normalisation() {
        assert_eq!(Frequency::Text("100.000".into()).label(), "100");
        assert_eq!(Frequency::Text("-0".into()).label(), "0");
        assert_eq!(Frequency::Text("88.10".into()).label(), "88.1");
        assert_eq!(Frequency::Text("fm".into()).as_f64(), None);
    }

    #[test]
    fn test_registry_event_ignores_extra_station_fields() {
        let raw = r#"{"event":"upsert","assignment":{
            "station_id":"2b1e","frequency":"99.5","name":"Night Owl",
            "stream_url":"http://node:8080/stream","created_at":"2025-01-01T00:00:00Z",
            "owner_public_key":"abc"}}"#;
        let evt: RegistryEvent = serde_json::from_str(raw).unwrap();
        match evt {
            RegistryEvent::Upsert(s) => assert_eq!(s.name, "Night Owl"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_registry_event_rejects_unknown_kind() {
        let raw = r#"{"event":"rename","assignment":{"station_id":"x","frequency":1,"name":"X","stream_url":"u"}}"#;
        assert!(serde_json::from_str::<RegistryEvent>(raw).is_err());
    }

    #[test]
    fn test_now_playing_summary() {
        let np = NowPlaying {
            artist: Some("Low".into()),
            title: Some("Words".into()),
            album: Some("I Could Live in Hope".into()),
            ..NowPlaying::default()
        };
        assert_eq!(np.summary("KXLU"), "Low - Words [I Could Live in Hope]");
        assert_eq!(NowPlaying::default().summary("KXLU"), "KXLU");
    }

    #[test]
    fn test_playback_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&PlaybackState::Starting).unwrap(),
            "\"starting\""
        );
        assert!(PlaybackState::Starting.is_active());
        assert!(!PlaybackState::Starting.is_playing());
        assert!(!PlaybackState::Stopped.is_active());
    }
}
