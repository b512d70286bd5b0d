//! Which backend requests refresh which parameters
//!
//! Polled set: studio mode, stream/record/virtual camera status, program
//! scene, current transition and its duration, optional performance stats,
//! plus volume and mute of each watched input. Push events covering the same
//! parameters are mapped here too, along with input meter levels which are
//! only ever pushed.

use serde_json::{json, Value};
use std::time::Duration;

pub const STUDIO_MODE: &str = "studio_mode";
pub const STREAM_ACTIVE: &str = "stream_active";
pub const RECORD_ACTIVE: &str = "record_active";
pub const VIRTUALCAM_ACTIVE: &str = "virtualcam_active";
pub const PROGRAM_SCENE: &str = "program_scene";
pub const TRANSITION: &str = "transition";
pub const TRANSITION_DURATION: &str = "transition_duration_ms";

pub const STATS_FPS: &str = "stats.fps";
pub const STATS_CPU: &str = "stats.cpu_percent";
pub const STATS_MEMORY: &str = "stats.memory_mb";
/// Derived from the stream byte counter between two cycles
pub const STATS_BITRATE: &str = "stats.stream_kbps";

pub const STREAM_STATUS: &str = "GetStreamStatus";
pub const INPUT_LIST: &str = "GetInputList";
pub const INPUT_VOLUME: &str = "GetInputVolume";
/// High-rate event (several per second per input)
pub const INPUT_VOLUME_METERS: &str = "InputVolumeMeters";

pub fn input_volume(input: &str) -> String {
    format!("input.{}.volume_db", input)
}

pub fn input_muted(input: &str) -> String {
    format!("input.{}.muted", input)
}

/// Meter magnitude of the first channel, 0.0 to 1.0
pub fn input_level(input: &str) -> String {
    format!("input.{}.level", input)
}

/// Every parameter name owned by one input
pub fn input_parameters(input: &str) -> [String; 3] {
    [input_volume(input), input_muted(input), input_level(input)]
}

pub fn is_level(name: &str) -> bool {
    name.starts_with("input.") && name.ends_with(".level")
}

/// One request and the parameters read from its response
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub request_type: &'static str,
    pub data: Option<Value>,
    /// `(parameter name, response field)`
    pub fields: Vec<(String, &'static str)>,
}

impl Query {
    fn new(request_type: &'static str, data: Option<Value>) -> Self {
        Self {
            request_type,
            data,
            fields: Vec::new(),
        }
    }

    fn field(mut self, parameter: impl Into<String>, field: &'static str) -> Self {
        self.fields.push((parameter.into(), field));
        self
    }
}

/// Queries for the global parameters
///
/// Transition name and duration share one `GetCurrentSceneTransition` call.
pub fn global_queries() -> Vec<Query> {
    vec![
        Query::new("GetStudioModeEnabled", None).field(STUDIO_MODE, "studioModeEnabled"),
        Query::new(STREAM_STATUS, None).field(STREAM_ACTIVE, "outputActive"),
        Query::new("GetRecordStatus", None).field(RECORD_ACTIVE, "outputActive"),
        Query::new("GetVirtualCamStatus", None).field(VIRTUALCAM_ACTIVE, "outputActive"),
        Query::new("GetCurrentProgramScene", None)
            .field(PROGRAM_SCENE, "currentProgramSceneName"),
        Query::new("GetCurrentSceneTransition", None)
            .field(TRANSITION, "transitionName")
            .field(TRANSITION_DURATION, "transitionDuration"),
    ]
}

/// Performance counters, one `GetStats` call
pub fn stats_queries() -> Vec<Query> {
    vec![Query::new("GetStats", None)
        .field(STATS_FPS, "activeFps")
        .field(STATS_CPU, "cpuUsage")
        .field(STATS_MEMORY, "memoryUsage")]
}

/// Queries for one audio input
pub fn input_queries(input: &str) -> Vec<Query> {
    let data = Some(json!({ "inputName": input }));
    vec![
        Query::new(INPUT_VOLUME, data.clone()).field(input_volume(input), "inputVolumeDb"),
        Query::new("GetInputMute", data).field(input_muted(input), "inputMuted"),
    ]
}

/// Stream bitrate from two samples of the output byte counter
///
/// `None` when no time passed or the counter went backwards (new stream).
pub fn bitrate_kbps(previous: (u64, Duration), current: (u64, Duration)) -> Option<f64> {
    let bytes = current.0.checked_sub(previous.0)?;
    let elapsed_ms = current.1.checked_sub(previous.1)?.as_millis();
    if elapsed_ms == 0 {
        return None;
    }
    Some((bytes as f64 * 8.0) / elapsed_ms as f64)
}

/// Input names listed in a `GetInputList` response, deduplicated
pub fn listed_inputs(response: &Value) -> Vec<String> {
    let mut names: Vec<String> = response
        .get("inputs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|input| input.get("inputName").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Events after which the input list should be fetched again
pub fn changes_input_list(event: &str) -> bool {
    matches!(event, "InputCreated" | "InputRemoved" | "InputNameChanged")
}

/// A parameter value carried by a push event
#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    /// Input the parameter belongs to, if any
    pub input: Option<String>,
    pub name: String,
    pub value: Value,
}

impl PushUpdate {
    fn global(name: &str, value: Value) -> Self {
        Self {
            input: None,
            name: name.to_string(),
            value,
        }
    }

    fn input(input: &str, name: String, value: Value) -> Self {
        Self {
            input: Some(input.to_string()),
            name,
            value,
        }
    }
}

/// First-channel magnitude of one `InputVolumeMeters` entry; silence when empty
fn meter_magnitude(input: &Value) -> f64 {
    input
        .get("inputLevelsMul")
        .and_then(|levels| levels.get(0))
        .and_then(|channel| channel.get(0))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Parameter updates carried by a push event
pub fn push_updates(event: &str, data: &Value) -> Vec<PushUpdate> {
    let field = |name: &str| data.get(name).cloned();
    let input = || data.get("inputName").and_then(Value::as_str);

    let update = match event {
        "CurrentProgramSceneChanged" => {
            field("sceneName").map(|v| PushUpdate::global(PROGRAM_SCENE, v))
        }
        "StreamStateChanged" => field("outputActive").map(|v| PushUpdate::global(STREAM_ACTIVE, v)),
        "RecordStateChanged" => field("outputActive").map(|v| PushUpdate::global(RECORD_ACTIVE, v)),
        "VirtualcamStateChanged" => {
            field("outputActive").map(|v| PushUpdate::global(VIRTUALCAM_ACTIVE, v))
        }
        "StudioModeStateChanged" => {
            field("studioModeEnabled").map(|v| PushUpdate::global(STUDIO_MODE, v))
        }
        "CurrentSceneTransitionChanged" => {
            field("transitionName").map(|v| PushUpdate::global(TRANSITION, v))
        }
        "CurrentSceneTransitionDurationChanged" => {
            field("transitionDuration").map(|v| PushUpdate::global(TRANSITION_DURATION, v))
        }
        "InputMuteStateChanged" => input()
            .zip(field("inputMuted"))
            .map(|(name, v)| PushUpdate::input(name, input_muted(name), v)),
        "InputVolumeChanged" => input()
            .zip(field("inputVolumeDb"))
            .map(|(name, v)| PushUpdate::input(name, input_volume(name), v)),
        INPUT_VOLUME_METERS => {
            return data
                .get("inputs")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let name = entry.get("inputName").and_then(Value::as_str)?;
                    Some(PushUpdate::input(
                        name,
                        input_level(name),
                        json!(meter_magnitude(entry)),
                    ))
                })
                .collect();
        }
        _ => None,
    };

    update.into_iter().collect()
}
