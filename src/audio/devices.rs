//! Capture device enumeration
//!
//! PipeWire nodes are listed through `pw-dump`, whose JSON output carries the
//! same properties the session manager shows in system settings. Both
//! sources and sinks are returned; sinks are captured through their monitor
//! ports, which is how loopback metering of the station output works.

use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;

use super::error::CaptureError;

/// Represents an audio capture device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioDevice {
    pub id: u32,
    /// PipeWire `node.name`, used as the stream target
    pub name: String,
    /// Human readable `node.description`
    pub description: String,
    /// True for sinks captured through their monitor ports
    pub is_monitor: bool,
}

impl AudioDevice {
    /// Substring match against the node name or description
    pub fn matches(&self, fragment: &str) -> bool {
        self.name.contains(fragment) || self.description.contains(fragment)
    }
}

/// First device satisfying `predicate`, in enumeration order
pub fn select_device<P>(devices: &[AudioDevice], mut predicate: P) -> Option<AudioDevice>
where
    P: FnMut(&AudioDevice) -> bool,
{
    devices.iter().find(|device| predicate(device)).cloned()
}

#[derive(Deserialize)]
struct PwObject {
    id: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    info: Option<PwInfo>,
}

#[derive(Deserialize)]
struct PwInfo {
    #[serde(default)]
    props: HashMap<String, serde_json::Value>,
}

const NODE_TYPE: &str = "PipeWire:Interface:Node";

/// Parse `pw-dump` output into capture devices
pub fn parse_pw_dump(json: &str) -> Result<Vec<AudioDevice>, serde_json::Error> {
    let objects: Vec<PwObject> = serde_json::from_str(json)?;

    let devices = objects
        .into_iter()
        .filter(|object| object.kind == NODE_TYPE)
        .filter_map(|object| {
            let props = object.info?.props;
            let prop = |key: &str| props.get(key).and_then(|v| v.as_str()).map(str::to_string);

            let class = prop("media.class")?;
            let is_monitor = match class.as_str() {
                "Audio/Source" | "Audio/Source/Virtual" | "Audio/Duplex" => false,
                "Audio/Sink" => true,
                _ => return None,
            };

            let name = prop("node.name")?;
            let description = prop("node.description")
                .or_else(|| prop("node.nick"))
                .unwrap_or_else(|| name.clone());

            Some(AudioDevice {
                id: object.id,
                name,
                description,
                is_monitor,
            })
        })
        .collect();

    Ok(devices)
}

/// Enumerate capture devices on the running PipeWire server
pub fn list_capture_devices() -> Result<Vec<AudioDevice>, CaptureError> {
    let output = Command::new("pw-dump")
        .output()
        .map_err(|e| CaptureError::Enumeration(format!("Failed to run pw-dump: {}", e)))?;

    if !output.status.success() {
        return Err(CaptureError::Enumeration(format!(
            "pw-dump exited with {}",
            output.status
        )));
    }

    let json = String::from_utf8_lossy(&output.stdout);
    let devices = parse_pw_dump(&json)
        .map_err(|e| CaptureError::Enumeration(format!("Invalid pw-dump output: {}", e)))?;

    log::debug!("Found {} capture devices", devices.len());
    Ok(devices)
}
