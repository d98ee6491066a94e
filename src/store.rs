use crate::command::{Command, Executor};
use crate::{Key, Slot};
use bytes::Bytes;
use std::collections::HashMap;

/// In-memory key-value state fed by committed slots.
///
/// Besides the latest value per key it retains every committed write in
/// commit order, which is what external consistency checks read back.
#[derive(Default, Debug)]
pub struct MemStore {
    data: HashMap<Key, Bytes>,
    history: HashMap<Key, Vec<Bytes>>,
}

impl MemStore {
    /// Latest committed value of a key.
    pub fn get(&self, key: Key) -> Option<&Bytes> {
        self.data.get(&key)
    }

    /// Every value committed for a key, in commit order.
    pub fn history(&self, key: Key) -> &[Bytes] {
        self.history.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Executor for MemStore {
    fn execute(&mut self, key: Key, slot: Slot, commands: &[Command]) {
        for command in commands {
            match &command.value {
                Some(value) => {
                    trace!("applying slot {} of key {}: {} bytes", slot, key, value.len());
                    self.data.insert(key, value.clone());
                    self.history.entry(key).or_insert_with(Vec::new).push(value.clone());
                }
                // reads carry no state change
                None => trace!("read of key {} decided at slot {}", key, slot),
            }
        }
    }
}
