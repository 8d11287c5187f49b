use std::fmt::Debug;

use crate::completion::Completion;
use crate::types::Datum;
use crate::types::DatumKey;

/// A datum in flight through the local work queue together with its completion signal.
pub struct WorkItem {
    datum:      Datum,
    completion: Completion<DatumKey>,
}

impl WorkItem {
    pub fn new(datum: Datum) -> Self {
        Self {
            datum,
            completion: Completion::new(),
        }
    }

    pub fn datum(&self) -> &Datum {
        &self.datum
    }

    pub fn completion(&self) -> &Completion<DatumKey> {
        &self.completion
    }
}

impl Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("key", &self.datum.key())
            .field("done", &self.completion.is_done())
            .finish()
    }
}
