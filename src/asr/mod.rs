//! Streaming speech recognition sessions
//!
//! One [`AsrManager`] owns every live recognition turn, at most one per
//! device. A turn moves `started -> receiving -> finishing` and ends when
//! the recognizer reports completion (record created, extraction kicked
//! off), failure, or when the client cancels it.
//!
//! Each turn carries a generation number. Recognizer events are applied
//! only while their generation is still the device's current one, so a
//! cancelled or superseded turn can never emit anything afterwards.

pub mod protocol;
mod recognizer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub use protocol::{RecognizerEvent, Sentence};
pub use recognizer::{DashScopeRecognizer, Recognizer, RecognizerCommand};

use crate::Error;
use crate::background::BackgroundTasks;
use crate::db::{NewRecord, RecordSource, RecordStatus, Store};
use crate::pipeline::{ProcessPipeline, ProcessRequest};
use crate::protocol::{AsrStart, Outbox, ServerMessage};
use crate::storage::AudioStore;

/// Message reported to the client when the recognizer link breaks
pub const CONNECTION_ERROR: &str = "ASR connection error";

/// Language tag stored with recognized transcripts
pub const TRANSCRIPT_LANGUAGE: &str = "zh";

/// Cap on audio buffered for saving, about ten minutes of 16 kHz PCM
pub const MAX_SAVED_AUDIO_BYTES: usize = 20 * 1024 * 1024;

/// Phase of a live recognition turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrState {
    /// Task requested, no audio yet
    Started,
    /// Audio is flowing
    Receiving,
    /// `finish-task` sent, waiting for the recognizer to complete
    Finishing,
}

struct AsrSession {
    generation: u64,
    task_id: String,
    commands: mpsc::UnboundedSender<RecognizerCommand>,
    state: AsrState,
    sentences: Vec<Sentence>,
    partial_text: String,
    location_text: Option<String>,
    /// Buffer audio for saving; set by `asr.start` or a prior `asr.stop`
    save_audio: bool,
    audio_chunks: Vec<Bytes>,
    audio_bytes: usize,
    audio_truncated: bool,
    outbox: Outbox,
    /// Connect-then-drive task of this turn
    worker: Option<AbortHandle>,
}

impl AsrSession {
    /// Keep a chunk for saving while the turn is under the cap
    fn buffer_audio(&mut self, chunk: &Bytes) {
        if !self.save_audio || self.audio_truncated {
            return;
        }
        let buffered = self.audio_bytes + chunk.len();
        if buffered > MAX_SAVED_AUDIO_BYTES {
            tracing::warn!(task_id = %self.task_id, buffered = self.audio_bytes, "saved audio cap reached");
            self.audio_truncated = true;
            return;
        }
        self.audio_bytes = buffered;
        self.audio_chunks.push(chunk.clone());
    }

    /// Stop the pending connect or the event loop right away
    fn abort_worker(&self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}

/// What to do after applying one recognizer event
enum Step {
    Forward(Outbox, ServerMessage),
    Fail(Outbox, ServerMessage),
    Finish(AsrSession),
    Continue,
    /// The turn was cancelled or superseded
    Stale,
}

/// Owner of all live recognition turns
#[derive(Clone)]
pub struct AsrManager {
    recognizer: Arc<dyn Recognizer>,
    sessions: Arc<Mutex<HashMap<String, AsrSession>>>,
    generation: Arc<AtomicU64>,
    store: Arc<dyn Store>,
    audio: Arc<dyn AudioStore>,
    pipeline: Arc<ProcessPipeline>,
    background: BackgroundTasks,
}

impl AsrManager {
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        store: Arc<dyn Store>,
        audio: Arc<dyn AudioStore>,
        pipeline: Arc<ProcessPipeline>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            recognizer,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            store,
            audio,
            pipeline,
            background,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AsrSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a turn, superseding any live turn of the device
    ///
    /// Returns once the turn is registered. The recognizer connects in a
    /// spawned task, so control frames keep flowing meanwhile and a cancel
    /// aborts the connect. Audio sent while it connects is queued.
    /// Connection failures are reported to `outbox` as `asr.error`.
    pub fn start(&self, request: AsrStart, outbox: Outbox) {
        let AsrStart {
            device_id,
            location_text,
            save_audio,
        } = request;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let task_id = uuid::Uuid::new_v4().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let session = AsrSession {
            generation,
            task_id: task_id.clone(),
            commands: commands_tx,
            state: AsrState::Started,
            sentences: Vec::new(),
            partial_text: String::new(),
            location_text,
            save_audio,
            audio_chunks: Vec::new(),
            audio_bytes: 0,
            audio_truncated: false,
            outbox: outbox.clone(),
            worker: None,
        };

        // The old turn's worker is aborted and its command channel dropped,
        // so its recognizer connection goes away without emitting anything
        let superseded = self.lock().insert(device_id.clone(), session);
        if let Some(old) = superseded {
            old.abort_worker();
            tracing::info!(device_id = %device_id, old_task_id = %old.task_id, "superseding live ASR session");
        }

        let worker = tokio::spawn(self.clone().connect(
            device_id.clone(),
            generation,
            task_id,
            commands_rx,
            outbox,
        ));
        if let Some(session) = self
            .lock()
            .get_mut(&device_id)
            .filter(|s| s.generation == generation)
        {
            session.worker = Some(worker.abort_handle());
        }
    }

    async fn connect(
        self,
        device_id: String,
        generation: u64,
        task_id: String,
        commands: mpsc::UnboundedReceiver<RecognizerCommand>,
        outbox: Outbox,
    ) {
        match self.recognizer.start(&task_id, commands).await {
            Ok(events) => {
                tracing::info!(device_id = %device_id, task_id = %task_id, "ASR session started");
                self.drive(device_id, generation, events).await;
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to start recognizer");
                if self.take_current(&device_id, generation).is_some() {
                    let message = match e {
                        Error::Config(message) => message,
                        _ => CONNECTION_ERROR.to_string(),
                    };
                    let _ = outbox.send(ServerMessage::asr_error(message)).await;
                }
            }
        }
    }

    /// Forward one audio chunk; false when the device has no live turn
    pub fn send_audio(&self, device_id: &str, chunk: Bytes) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(device_id) else {
            return false;
        };

        if session.state == AsrState::Started {
            session.state = AsrState::Receiving;
        }
        session.buffer_audio(&chunk);
        session.commands.send(RecognizerCommand::Audio(chunk)).is_ok()
    }

    /// Ask the recognizer to finish; the turn ends when it reports back
    pub fn stop(&self, device_id: &str, save_audio: bool) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(device_id) else {
            return false;
        };

        if save_audio {
            session.save_audio = true;
        }
        if session.state == AsrState::Finishing {
            return true;
        }
        session.state = AsrState::Finishing;
        tracing::debug!(device_id, task_id = %session.task_id, "finishing ASR session");
        session.commands.send(RecognizerCommand::Finish).is_ok()
    }

    /// Drop the device's turn immediately; safe in any state
    pub fn cancel(&self, device_id: &str) -> bool {
        let removed = self.lock().remove(device_id);
        if let Some(session) = &removed {
            session.abort_worker();
            tracing::info!(device_id, task_id = %session.task_id, "ASR session cancelled");
        }
        removed.is_some()
    }

    #[must_use]
    pub fn state(&self, device_id: &str) -> Option<AsrState> {
        self.lock().get(device_id).map(|s| s.state)
    }

    /// Latest unconfirmed text of the device's turn
    #[must_use]
    pub fn partial_text(&self, device_id: &str) -> Option<String> {
        self.lock().get(device_id).map(|s| s.partial_text.clone())
    }

    /// Bytes held for saving in the device's turn
    #[must_use]
    pub fn buffered_audio_bytes(&self, device_id: &str) -> Option<usize> {
        self.lock().get(device_id).map(|s| s.audio_bytes)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn take_current(&self, device_id: &str, generation: u64) -> Option<AsrSession> {
        let mut sessions = self.lock();
        if sessions.get(device_id)?.generation != generation {
            return None;
        }
        sessions.remove(device_id)
    }

    async fn drive(
        self,
        device_id: String,
        generation: u64,
        mut events: mpsc::Receiver<RecognizerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match self.apply(&device_id, generation, event) {
                Step::Forward(outbox, message) => {
                    let _ = outbox.send(message).await;
                }
                Step::Fail(outbox, message) => {
                    let _ = outbox.send(message).await;
                    return;
                }
                Step::Finish(session) => {
                    self.finish_turn(&device_id, session).await;
                    return;
                }
                Step::Continue => {}
                Step::Stale => return,
            }
        }

        // Event stream ended without a terminal event
        if let Some(session) = self.take_current(&device_id, generation) {
            tracing::warn!(device_id = %device_id, task_id = %session.task_id, "recognizer stream ended early");
            let _ = session
                .outbox
                .send(ServerMessage::asr_error(CONNECTION_ERROR))
                .await;
        }
    }

    fn apply(&self, device_id: &str, generation: u64, event: RecognizerEvent) -> Step {
        let mut sessions = self.lock();
        let Some(session) = sessions
            .get_mut(device_id)
            .filter(|s| s.generation == generation)
        else {
            return Step::Stale;
        };

        match event {
            RecognizerEvent::Started => Step::Continue,
            RecognizerEvent::Partial { text, sentence_id } => {
                session.partial_text.clone_from(&text);
                Step::Forward(
                    session.outbox.clone(),
                    ServerMessage::AsrPartial {
                        text,
                        sentence_id: sentence_id.unwrap_or(0),
                    },
                )
            }
            RecognizerEvent::Sentence(sentence) => {
                session.partial_text.clear();
                session.sentences.push(sentence.clone());
                let fallback_id = u64::try_from(session.sentences.len() - 1).unwrap_or(u64::MAX);
                Step::Forward(
                    session.outbox.clone(),
                    ServerMessage::AsrSentence {
                        text: sentence.text,
                        sentence_id: sentence.sentence_id.unwrap_or(fallback_id),
                        begin_time: sentence.begin_time,
                        end_time: sentence.end_time,
                    },
                )
            }
            RecognizerEvent::Finished => sessions
                .remove(device_id)
                .map_or(Step::Stale, Step::Finish),
            RecognizerEvent::Failed(message) => {
                tracing::warn!(device_id, error = %message, "recognition task failed");
                sessions.remove(device_id).map_or(Step::Stale, |s| {
                    Step::Fail(s.outbox, ServerMessage::asr_error(message))
                })
            }
            RecognizerEvent::ConnectionError(message) => {
                tracing::warn!(device_id, error = %message, "recognizer connection error");
                sessions.remove(device_id).map_or(Step::Stale, |s| {
                    Step::Fail(s.outbox, ServerMessage::asr_error(CONNECTION_ERROR))
                })
            }
        }
    }

    /// Turn confirmed sentences into a record and hand it to extraction
    async fn finish_turn(&self, device_id: &str, session: AsrSession) {
        let transcript: String = session.sentences.iter().map(|s| s.text.as_str()).collect();

        if transcript.trim().is_empty() {
            tracing::info!(device_id, "ASR session finished without speech");
            let _ = session.outbox.send(ServerMessage::empty_asr_done()).await;
            return;
        }

        let duration = session
            .sentences
            .last()
            .map_or(0, |s| duration_seconds(s.end_time));

        let record = match self
            .store
            .create_record(NewRecord {
                device_id: device_id.to_string(),
                status: RecordStatus::Processing,
                source: RecordSource::Voice,
                duration_seconds: Some(duration),
                location_text: session.location_text.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(device_id, error = %e, "failed to create record for transcript");
                let _ = session
                    .outbox
                    .send(ServerMessage::error(format!("Failed to save recording: {e}")))
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .store
            .add_transcript(&record.id, &transcript, TRANSCRIPT_LANGUAGE)
            .await
        {
            tracing::error!(record_id = %record.id, error = %e, "failed to save transcript");
        }

        tracing::info!(device_id, record_id = %record.id, duration, "ASR session done");
        let _ = session
            .outbox
            .send(ServerMessage::AsrDone {
                transcript: transcript.clone(),
                record_id: record.id.clone(),
                duration,
            })
            .await;

        if session.save_audio && !session.audio_chunks.is_empty() {
            let store = Arc::clone(&self.store);
            let audio = Arc::clone(&self.audio);
            let (device_id, record_id) = (device_id.to_string(), record.id.clone());
            let chunks = session.audio_chunks;
            self.background.spawn("save audio", async move {
                let path = audio.save(&device_id, &chunks).await?;
                store.set_record_audio(&record_id, &path).await
            });
        }

        let pipeline = Arc::clone(&self.pipeline);
        let outbox = session.outbox;
        let request = ProcessRequest::new(transcript, device_id, record.id);
        self.background.spawn("post-asr process", async move {
            let result = pipeline.run(request).await;
            let _ = outbox.send(ServerMessage::ProcessResult(result)).await;
            Ok(())
        });
    }
}

/// Whole seconds of a millisecond offset, rounded half up
#[must_use]
pub fn duration_seconds(end_time_ms: u64) -> u32 {
    u32::try_from(end_time_ms.saturating_add(500) / 1000).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_rounds_to_seconds() {
        assert_eq!(duration_seconds(0), 0);
        assert_eq!(duration_seconds(499), 0);
        assert_eq!(duration_seconds(1500), 2);
        assert_eq!(duration_seconds(2000), 2);
    }
}
