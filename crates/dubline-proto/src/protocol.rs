use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// One timed transcript line.  `start`/`end` are playback seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Line {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }
}

/// User-facing caption settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub language: String,
    /// Free-form disambiguation hint forwarded to the translator.
    #[serde(default)]
    pub hint: String,
}

/// Raw playback signals coming from the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    TimeUpdate { t: f64 },
    Seek { t: f64 },
    RateChange,
    Play,
    Pause,
}

/// Messages sent from clients to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Enable {
        settings: Settings,
    },
    Disable,
    SettingsChanged {
        enabled: bool,
        settings: Settings,
    },
    ContextChanged {
        media_id: String,
    },
    Playback(PlaybackEvent),
    AdStateChanged {
        is_ad: bool,
    },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: EngineState,
    },
    State {
        data: EngineState,
    },
    /// The caption text currently shown; empty means blank.
    Caption {
        text: String,
    },
    Log {
        message: String,
    },
}

/// Session mode.
///
/// Transitions:
///   Idle -> Active            (attach succeeded)
///   Active -> Error           (hydration failed)
///   Error -> Active           (recovery timer or explicit enable)
///   * -> Idle                 (disable, attach exhausted)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    Active,
    Error,
}

/// Which network round trip an in-flight hydration is waiting on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Stage {
    FetchingLines,
    Translating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightInfo {
    pub generation: u64,
    pub stage: Stage,
}

/// Read-only snapshot of the engine.  `rev` is incremented every time the
/// snapshot changes so clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineState {
    #[serde(default)]
    pub rev: u64,
    pub mode: Mode,
    pub enabled: bool,
    pub language: String,
    pub hint: String,
    pub media_id: Option<String>,
    /// Last text handed to the renderer.
    pub caption: String,
    pub position_secs: Option<f64>,
    #[serde(default)]
    pub ad_playing: bool,
    #[serde(default)]
    pub in_flight: Option<InFlightInfo>,
    #[serde(default)]
    pub cached_buckets: usize,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// Frame as a big-endian `u32` length followed by the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
