use serde_json::Value as JsonValue;

use crate::error::DispatchError;
use crate::rules::Target;

/// Results addressed by original call index, so batched and single calls can
/// land in any order and still come out in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultBuffer {
    slots: Vec<Option<JsonValue>>,
}

impl ResultBuffer {
    pub fn new(call_count: usize) -> Self {
        Self {
            slots: vec![None; call_count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn put(&mut self, index: usize, value: JsonValue) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(value);
        }
    }

    /// Store the values of one batched invocation at `indices`, pairwise.
    pub fn put_batch(
        &mut self,
        target: &Target,
        indices: &[usize],
        values: Vec<JsonValue>,
    ) -> Result<(), DispatchError> {
        if values.len() != indices.len() {
            return Err(DispatchError::BatchResultMismatch {
                module: target.module.clone(),
                method: target.method.clone(),
                expected: indices.len(),
                got: values.len(),
            });
        }
        for (&idx, value) in indices.iter().zip(values) {
            self.put(idx, value);
        }
        Ok(())
    }

    /// All values in call order; fails if any slot was never written.
    pub fn into_ordered(self) -> Result<Vec<JsonValue>, DispatchError> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(DispatchError::Incomplete { index }))
            .collect()
    }
}
