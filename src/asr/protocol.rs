//! Realtime recognizer task protocol
//!
//! A task is opened with a `run-task` text frame, fed raw PCM as binary
//! frames, and closed with `finish-task`. The service answers with
//! `task-started`, any number of `result-generated`, and finally
//! `task-finished` or `task-failed`.

use serde::Deserialize;
use serde_json::json;

use crate::{Error, Result};

/// `run-task` frame opening a duplex recognition task
#[must_use]
pub fn run_task(task_id: &str, model: &str, sample_rate: u32) -> String {
    json!({
        "header": {
            "action": "run-task",
            "task_id": task_id,
            "streaming": "duplex",
        },
        "payload": {
            "task_group": "audio",
            "task": "asr",
            "function": "recognition",
            "model": model,
            "parameters": {
                "format": "pcm",
                "sample_rate": sample_rate,
                "vocabulary_id": "",
                "disfluency_removal_enabled": false,
            },
            "input": {},
        },
    })
    .to_string()
}

/// `finish-task` frame; the service flushes and then reports `task-finished`
#[must_use]
pub fn finish_task(task_id: &str) -> String {
    json!({
        "header": {
            "action": "finish-task",
            "task_id": task_id,
            "streaming": "duplex",
        },
        "payload": { "input": {} },
    })
    .to_string()
}

/// Confirmed sentence with offsets in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    pub sentence_id: Option<u64>,
    pub begin_time: u64,
    pub end_time: u64,
}

/// Event surfaced by a recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    Started,
    Partial {
        text: String,
        sentence_id: Option<u64>,
    },
    Sentence(Sentence),
    Finished,
    /// The service reported the task as failed
    Failed(String),
    /// The connection broke before the task finished
    ConnectionError(String),
}

#[derive(Deserialize)]
struct Frame {
    header: Header,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct Header {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    output: Option<Output>,
}

#[derive(Deserialize)]
struct Output {
    #[serde(default)]
    sentence: Option<RawSentence>,
}

#[derive(Deserialize)]
struct RawSentence {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sentence_id: Option<u64>,
    #[serde(default)]
    begin_time: Option<u64>,
    #[serde(default)]
    end_time: Option<u64>,
    #[serde(default)]
    sentence_end: Option<bool>,
}

/// Decode one text frame from the service
///
/// Returns `Ok(None)` for frames that carry nothing actionable.
///
/// # Errors
///
/// Returns error if the frame is not a JSON task frame
pub fn parse_event(text: &str) -> Result<Option<RecognizerEvent>> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|e| Error::Asr(format!("invalid recognizer frame: {e}")))?;

    let event = match frame.header.event.as_deref() {
        Some("task-started") => Some(RecognizerEvent::Started),
        Some("task-finished") => Some(RecognizerEvent::Finished),
        Some("task-failed") => Some(RecognizerEvent::Failed(
            frame
                .header
                .error_message
                .unwrap_or_else(|| "ASR task failed".to_string()),
        )),
        Some("result-generated") => frame
            .payload
            .and_then(|p| p.output)
            .and_then(|o| o.sentence)
            .map(sentence_event),
        _ => None,
    };
    Ok(event)
}

fn sentence_event(raw: RawSentence) -> RecognizerEvent {
    let text = raw.text.unwrap_or_default();
    match (raw.begin_time, raw.end_time, raw.sentence_end) {
        (Some(begin_time), Some(end_time), None | Some(true)) => {
            RecognizerEvent::Sentence(Sentence {
                text,
                sentence_id: raw.sentence_id,
                begin_time,
                end_time,
            })
        }
        _ => RecognizerEvent::Partial {
            text,
            sentence_id: raw.sentence_id,
        },
    }
}
