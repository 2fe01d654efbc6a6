//! Operator event feed persisted in `events.json`, newest first.

use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use mc_core::{current_unix_timestamp_ms, OpsError, StateStore};

use crate::output::CommandReport;

/// File name of the event feed inside the state directory.
pub const EVENTS_FILE: &str = "events.json";

/// Feed length cap applied on save.
pub const MAX_EVENTS: usize = 500;

/// One immutable event; only `acknowledged` may change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub acknowledged: bool,
    pub created_at: String,
}

/// On-disk feed shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsState {
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

fn validate_events(state: &EventsState) -> Result<(), String> {
    for event in &state.events {
        if event.id.is_empty() {
            return Err("event with empty id".to_string());
        }
        if !event.id.starts_with("evt_") {
            return Err(format!("event id '{}' has the wrong shape", event.id));
        }
    }
    Ok(())
}

/// Mints an event id: `evt_<unix-millis>_<12 hex chars>`.
pub fn new_event_id(now_ms: u64) -> String {
    let mut random = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut random);
    format!("evt_{now_ms}_{}", hex::encode(random))
}

const KNOWN_SEVERITIES: &[&str] = &["critical", "high", "medium", "low", "info"];

/// Appends one event and enforces the feed cap.
pub fn record_event(
    store: &StateStore,
    severity: &str,
    title: &str,
    message: &str,
    source: &str,
    metadata: Value,
) -> Result<EventRecord, OpsError> {
    let severity = severity.to_ascii_lowercase();
    if !KNOWN_SEVERITIES.contains(&severity.as_str()) {
        return Err(OpsError::Usage(format!(
            "unknown severity '{severity}'; expected one of {}",
            KNOWN_SEVERITIES.join("|")
        )));
    }
    let event = EventRecord {
        id: new_event_id(current_unix_timestamp_ms()),
        event_type: "operator".to_string(),
        severity,
        title: mc_core::sanitize_for_log(title),
        message: mc_core::sanitize_for_log(message),
        source: source.to_string(),
        metadata,
        acknowledged: false,
        created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    };
    let stored = event.clone();
    store
        .atomic_update(EVENTS_FILE, validate_events, move |mut state: EventsState| {
            state.events.insert(0, stored);
            state.events.truncate(MAX_EVENTS);
            Ok(state)
        })
        .map_err(OpsError::Generic)?;
    Ok(event)
}

/// Lists events newest-first, optionally only unacknowledged ones.
pub fn list_events(store: &StateStore, limit: usize, unacked_only: bool) -> Vec<EventRecord> {
    let state: EventsState = store.load_state(EVENTS_FILE, validate_events);
    state
        .events
        .into_iter()
        .filter(|event| !unacked_only || !event.acknowledged)
        .take(limit)
        .collect()
}

/// Flags one event as acknowledged.
pub fn acknowledge_event(store: &StateStore, id: &str) -> Result<EventRecord, OpsError> {
    let mut found: Option<EventRecord> = None;
    store
        .atomic_update(EVENTS_FILE, validate_events, |mut state: EventsState| {
            match state.events.iter_mut().find(|event| event.id == id) {
                Some(event) => {
                    event.acknowledged = true;
                    found = Some(event.clone());
                    Ok(state)
                }
                None => Ok(state),
            }
        })
        .map_err(OpsError::Generic)?;
    found.ok_or_else(|| OpsError::Absent(format!("event '{id}' not found")))
}

/// Renders a feed listing.
pub fn list_report(events: &[EventRecord]) -> CommandReport {
    let human = if events.is_empty() {
        "no events".to_string()
    } else {
        events
            .iter()
            .map(|event| {
                format!(
                    "{} [{}] {}{}",
                    event.id,
                    event.severity,
                    event.title,
                    if event.acknowledged { " (acked)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    CommandReport::new(human, json!({ "events": events }))
}
