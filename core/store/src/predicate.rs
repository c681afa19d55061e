//! Query predicates over entity fields.

use serde::{Deserialize, Serialize};

use tidesync_common::{Entity, Value};

/// A filter over live entities of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Every entity.
    All,
    /// Field equals the given value.
    FieldEq { field: String, value: Value },
    /// Field is present.
    Exists { field: String },
    /// Set or list field contains the given text item.
    Contains { field: String, item: String },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::FieldEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Predicate::Exists {
            field: field.into(),
        }
    }

    pub fn contains(field: impl Into<String>, item: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.into(),
            item: item.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            this => Predicate::Or(vec![this, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Whether the entity matches. Tombstones never match.
    pub fn matches(&self, entity: &Entity) -> bool {
        !entity.tombstone && self.eval(entity)
    }

    fn eval(&self, entity: &Entity) -> bool {
        match self {
            Predicate::All => true,
            Predicate::FieldEq { field, value } => entity.value(field) == Some(value),
            Predicate::Exists { field } => entity.fields.contains_key(field),
            Predicate::Contains { field, item } => match entity.value(field) {
                Some(Value::Set(items)) => items.contains(item),
                Some(Value::List(items)) => items.iter().any(|v| v.as_str() == Some(item)),
                _ => false,
            },
            Predicate::And(parts) => parts.iter().all(|p| p.eval(entity)),
            Predicate::Or(parts) => parts.iter().any(|p| p.eval(entity)),
            Predicate::Not(inner) => !inner.eval(entity),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_common::{EntityKey, FieldPatch, ReplicaId, Version};

    fn player(session: &str, hp: i64) -> Entity {
        let mut e = Entity::new(EntityKey::parse("players", "p1").unwrap());
        e.apply_patch(
            &FieldPatch::new()
                .set("session_id", session)
                .set("hp", hp)
                .add_to_set("skills", ["stealth"]),
            Version::new(1),
            &ReplicaId::new("r").unwrap(),
        );
        e
    }

    #[test]
    fn test_field_eq() {
        let p = Predicate::eq("session_id", "s1");
        assert!(p.matches(&player("s1", 10)));
        assert!(!p.matches(&player("s2", 10)));
    }

    #[test]
    fn test_combinators() {
        let p = Predicate::eq("session_id", "s1").and(Predicate::eq("hp", 10).negate());
        assert!(p.matches(&player("s1", 12)));
        assert!(!p.matches(&player("s1", 10)));

        let p = Predicate::eq("hp", 1).or(Predicate::contains("skills", "stealth"));
        assert!(p.matches(&player("s1", 10)));
    }

    #[test]
    fn test_tombstones_never_match() {
        let mut e = player("s1", 10);
        e.make_tombstone();
        assert!(!Predicate::All.matches(&e));
        assert!(!Predicate::exists("hp").negate().matches(&e));
    }
}
