use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::sync::lock;
use crate::types::ManualIntent;

#[derive(Debug, Clone, Copy)]
struct IntentRecord {
    intent: ManualIntent,
    noted_at: Option<DateTime<Utc>>,
}

/// Remembers whether the current power state was asked for by an operator.
///
/// A stopped VM looks the same whether it crashed or was shut down for
/// maintenance. The intent is recorded when the request is accepted, before
/// the backend call is made, so the monitor can tell the two apart.
#[derive(Debug)]
pub struct ManualIntentTracker {
    record: Mutex<IntentRecord>,
}

impl ManualIntentTracker {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(IntentRecord {
                intent: ManualIntent::None,
                noted_at: None,
            }),
        }
    }

    pub fn note_manual_stop(&self) {
        self.note(ManualIntent::Stop);
    }

    pub fn note_manual_start(&self) {
        self.note(ManualIntent::Start);
    }

    fn note(&self, intent: ManualIntent) {
        let mut record = lock(&self.record);
        record.intent = intent;
        record.noted_at = Some(Utc::now());
        log::debug!("Manual intent recorded: {}", intent.as_str());
    }

    pub fn was_manual_stop_most_recent(&self) -> bool {
        lock(&self.record).intent == ManualIntent::Stop
    }

    pub fn current(&self) -> ManualIntent {
        lock(&self.record).intent
    }

    pub fn noted_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.record).noted_at
    }

    pub fn clear(&self) {
        let mut record = lock(&self.record);
        record.intent = ManualIntent::None;
        record.noted_at = None;
    }

    /// A pending Start is fulfilled once the machine is seen running.
    /// A Stop stays in force until an operator or a recovery supersedes it.
    pub fn acknowledge_power(&self, running: bool) {
        let mut record = lock(&self.record);
        if running && record.intent == ManualIntent::Start {
            record.intent = ManualIntent::None;
            record.noted_at = None;
            log::debug!("Manual start confirmed by power state");
        }
    }
}

impl Default for ManualIntentTracker {
    fn default() -> Self {
        Self::new()
    }
}
