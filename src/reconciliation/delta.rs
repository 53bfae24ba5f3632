/// Delta computation between a local collection and remote id/metadata headers.
use crate::entity::Entity;
use std::collections::{HashMap, HashSet};

/// What a pull has to do to bring the local collection up to date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaSet {
    /// Ids to re-fetch, in remote order.
    pub refetch_ids: Vec<String>,
    /// Local entities whose `lastModifiedAt` matches the server, in local order.
    pub unchanged: Vec<Entity>,
    /// Local ids the server no longer returns for the filter.
    pub missing_remotely: Vec<String>,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.refetch_ids.is_empty()
    }
}

/// Compare local entities with remote `{id, metadata}` headers.
///
/// An entity is unchanged only if both sides carry a `lastModifiedAt` and the
/// strings are identical; any difference, including a missing timestamp,
/// marks it for re-fetch.
pub fn compute_delta(local: Vec<Entity>, remote: &[Entity]) -> DeltaSet {
    let remote_lmt: HashMap<&str, Option<&str>> = remote
        .iter()
        .filter_map(|e| e.id().map(|id| (id, e.last_modified_at())))
        .collect();

    let mut delta = DeltaSet::default();
    let mut still_valid: HashSet<String> = HashSet::new();

    for entity in local {
        let Some(id) = entity.id() else { continue };
        match remote_lmt.get(id) {
            Some(remote) => {
                let same = matches!(
                    (entity.last_modified_at(), remote),
                    (Some(a), Some(b)) if a == *b
                );
                if same {
                    still_valid.insert(id.to_string());
                    delta.unchanged.push(entity);
                }
            }
            None => delta.missing_remotely.push(id.to_string()),
        }
    }

    let mut queued: HashSet<&str> = HashSet::new();
    for id in remote.iter().filter_map(Entity::id) {
        if !still_valid.contains(id) && queued.insert(id) {
            delta.refetch_ids.push(id.to_string());
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn synced(id: &str, lmt: &str) -> Entity {
        Entity::from_json(json!({"id": id, "metadata": {"lastModifiedAt": lmt}})).unwrap()
    }

    #[test]
    fn test_unchanged_entities_are_kept() {
        let local = vec![synced("a", "t1"), synced("b", "t1")];
        let remote = vec![synced("a", "t1"), synced("b", "t2")];

        let delta = compute_delta(local, &remote);
        assert_eq!(delta.refetch_ids, vec!["b".to_string()]);
        assert_eq!(delta.unchanged, vec![synced("a", "t1")]);
    }

    #[test]
    fn test_remote_only_and_local_only() {
        let local = vec![synced("gone", "t1"), Entity::with_id("draft")];
        let remote = vec![synced("new", "t1")];

        let delta = compute_delta(local, &remote);
        assert_eq!(delta.refetch_ids, vec!["new".to_string()]);
        assert!(delta.unchanged.is_empty());
        assert_eq!(
            delta.missing_remotely,
            vec!["gone".to_string(), "draft".to_string()]
        );
    }

    #[test]
    fn test_timestamps_compare_as_strings() {
        let local = vec![synced("a", "2024-01-01T00:00:00.000Z")];
        let remote = vec![synced("a", "2024-01-01T00:00:00Z")];

        let delta = compute_delta(local, &remote);
        assert_eq!(delta.refetch_ids, vec!["a".to_string()]);
    }

    #[test]
    fn test_local_without_metadata_is_refetched() {
        let local = vec![Entity::with_id("a")];
        let remote = vec![synced("a", "t1")];

        let delta = compute_delta(local, &remote);
        assert_eq!(delta.refetch_ids, vec!["a".to_string()]);
        assert!(delta.missing_remotely.is_empty());
    }
}
