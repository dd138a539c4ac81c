use crate::{EntityDescriptor, Result, util::lock};
use std::{collections::HashMap, ops::Range, sync::Mutex};

/// Hands out identifiers for new records.
///
/// Batched inserts reserve a whole range up front so that rows do not cost an
/// identifier round-trip each; `reconcile` is called once the batch is gone.
pub trait IdentityProvider: Send + Sync + 'static {
    fn next_id(&self, entity: &EntityDescriptor) -> Result<i64>;
    fn reserve(&self, entity: &EntityDescriptor, count: usize) -> Result<()>;
    fn reconcile(&self, entity: &EntityDescriptor) -> Result<()>;
}

#[derive(Debug, Default)]
struct Sequence {
    next: i64,
    reserved: Range<i64>,
}

/// In-process monotonic identifiers per table, starting at `start`.
#[derive(Debug)]
pub struct SequentialIdentity {
    start: i64,
    sequences: Mutex<HashMap<String, Sequence>>,
}

impl Default for SequentialIdentity {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SequentialIdentity {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            sequences: Default::default(),
        }
    }

    /// Identifiers reserved and not yet handed out for `entity`.
    pub fn reserved(&self, entity: &EntityDescriptor) -> usize {
        lock(&self.sequences)
            .get(entity.table_name.as_ref())
            .map(|s| s.reserved.clone().count())
            .unwrap_or_default()
    }
}

impl IdentityProvider for SequentialIdentity {
    fn next_id(&self, entity: &EntityDescriptor) -> Result<i64> {
        let mut sequences = lock(&self.sequences);
        let sequence = sequences
            .entry(entity.table_name.to_string())
            .or_insert_with(|| Sequence {
                next: self.start,
                reserved: self.start..self.start,
            });
        if let Some(id) = sequence.reserved.next() {
            return Ok(id);
        }
        let id = sequence.next;
        sequence.next += 1;
        Ok(id)
    }

    fn reserve(&self, entity: &EntityDescriptor, count: usize) -> Result<()> {
        let mut sequences = lock(&self.sequences);
        let sequence = sequences
            .entry(entity.table_name.to_string())
            .or_insert_with(|| Sequence {
                next: self.start,
                reserved: self.start..self.start,
            });
        if sequence.reserved.is_empty() {
            let end = sequence.next + count as i64;
            sequence.reserved = sequence.next..end;
            sequence.next = end;
            log::trace!(
                "Reserved identifiers {:?} for `{}`",
                sequence.reserved,
                entity.table_name
            );
        }
        Ok(())
    }

    fn reconcile(&self, entity: &EntityDescriptor) -> Result<()> {
        if let Some(sequence) = lock(&self.sequences).get_mut(entity.table_name.as_ref()) {
            // Unused reservations are dropped, identifiers stay monotonic
            sequence.reserved = sequence.next..sequence.next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDescriptor, Value};

    #[test]
    fn reserve_then_reconcile() {
        let entity = EntityDescriptor {
            entity_name: "Person".into(),
            table_name: "person".into(),
            fields: [FieldDescriptor::new("id", "id", Value::Int64(None))].into(),
            identity: 0,
            batch_size: Some(3),
        };
        let identity = SequentialIdentity::default();
        assert_eq!(identity.next_id(&entity).unwrap(), 1);
        identity.reserve(&entity, 3).unwrap();
        assert_eq!(identity.reserved(&entity), 3);
        assert_eq!(identity.next_id(&entity).unwrap(), 2);
        assert_eq!(identity.next_id(&entity).unwrap(), 3);
        identity.reconcile(&entity).unwrap();
        assert_eq!(identity.reserved(&entity), 0);
        assert_eq!(identity.next_id(&entity).unwrap(), 5);
    }
}
