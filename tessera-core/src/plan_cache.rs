use crate::QueryPlan;
use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
};

/// Declared result shape of a repository method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    Single,
    Multiple,
    Nothing,
}

impl ReturnShape {
    pub fn name(&self) -> &'static str {
        match self {
            ReturnShape::Single => "Single",
            ReturnShape::Multiple => "Multiple",
            ReturnShape::Nothing => "Nothing",
        }
    }
}

/// Unit separator, never part of a method or entity identifier.
const SEPARATOR: char = '\u{1f}';

/// Stable key of a compiled plan: method, entity, return shape and template hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanId(Arc<str>);

impl PlanId {
    pub fn new(method: &str, entity: &str, shape: &str, template: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        template.unwrap_or_default().hash(&mut hasher);
        Self(
            format!(
                "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{:016x}",
                method,
                entity,
                shape,
                hasher.finish()
            )
            .into(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compiled plans for the lifetime of the engine. Entries are never evicted,
/// the key space is bounded by the number of distinct repository methods.
#[derive(Debug, Default)]
pub struct QueryPlanCache {
    plans: RwLock<HashMap<PlanId, Arc<QueryPlan>>>,
}

impl QueryPlanCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, id: &PlanId) -> Option<Arc<QueryPlan>> {
        self.plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Insert `plan` unless another caller won the race, returns the cached plan.
    pub fn put(&self, id: PlanId, plan: QueryPlan) -> Arc<QueryPlan> {
        self.plans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert_with(|| Arc::new(plan))
            .clone()
    }

    pub fn get_or_try_insert<F>(&self, id: &PlanId, compile: F) -> crate::Result<Arc<QueryPlan>>
    where
        F: FnOnce() -> crate::Result<QueryPlan>,
    {
        if let Some(plan) = self.get(id) {
            return Ok(plan);
        }
        let plan = compile()?;
        log::debug!("Compiled plan `{}`: {}", id, plan.sql);
        Ok(self.put(id.clone(), plan))
    }

    pub fn len(&self) -> usize {
        self.plans.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cardinality;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn plan_ids() {
        let a = PlanId::new("findByName", "Person", "Single", None);
        let b = PlanId::new("findByName", "Person", "Single", Some(""));
        let c = PlanId::new("findByName", "Person", "Single", Some("SELECT 1"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("findByName\u{1f}Person\u{1f}Single\u{1f}"));
        assert_ne!(
            PlanId::new("findByNameX", "Y", "Single", None),
            PlanId::new("findByName", "XY", "Single", None)
        );
    }

    #[test]
    fn compiles_once() {
        let cache = QueryPlanCache::new();
        let id = PlanId::new("findAll", "Person", "Multiple", Some("SELECT * FROM person"));
        let compiled = AtomicUsize::new(0);
        let compile = || {
            compiled.fetch_add(1, Ordering::Relaxed);
            Ok(QueryPlan::from_template("SELECT * FROM person", Cardinality::Multiple))
        };
        let first = cache.get_or_try_insert(&id, compile).unwrap();
        let second = cache.get_or_try_insert(&id, compile).unwrap();
        assert_eq!(compiled.load(Ordering::Relaxed), 1);
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
