//! The pure reconciliation diff.
//!
//! Matching is keyed on the durable external identity first and the
//! case-folded name second. Identity matching runs across the whole observed
//! batch before any name-collision decision, so two repositories trading
//! names in one pass both resolve to renames instead of one of them being
//! deleted.

use catalog_core::{Diff, ModifiedFields, ModifiedRepo, Repo};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// Classifies `observed` against `stored` for the service identified by
/// `urn`. `stored` is every repository currently associated with that
/// service; the clock is injected so results are deterministic.
pub fn diff(urn: &str, stored: Vec<Repo>, observed: Vec<Repo>, now: DateTime<Utc>) -> Diff {
    let observed = dedupe_observed(observed);
    let mut stored = stored;

    let mut id_index: HashMap<_, usize> = HashMap::new();
    let mut name_index: HashMap<String, usize> = HashMap::new();
    for (i, s) in stored.iter().enumerate() {
        if s.external_repo.is_set() {
            id_index.insert(s.external_repo.clone(), i);
        }
        name_index.insert(s.folded_name(), i);
    }

    // Stored repos claimed by identity anywhere in the batch. Computed up
    // front: a claimed repo is never a collision casualty, it will be
    // renamed by its own observation.
    let claimed: HashSet<usize> = observed
        .iter()
        .filter(|o| o.external_repo.is_set())
        .filter_map(|o| id_index.get(&o.external_repo).copied())
        .collect();

    let mut diff = Diff::default();
    let mut matched: HashSet<usize> = HashSet::new();
    let mut collided: HashSet<usize> = HashSet::new();

    for mut o in observed {
        let identity_match = o
            .external_repo
            .is_set()
            .then(|| id_index.get(&o.external_repo).copied())
            .flatten();

        match identity_match {
            Some(si) => {
                matched.insert(si);

                // The target name may be held by an unrelated stored repo.
                if let Some(&ni) = name_index.get(&o.folded_name())
                    && ni != si
                    && !claimed.contains(&ni)
                {
                    collided.insert(ni);
                }

                let s = &mut stored[si];
                let fields = s.update_from(&o);
                if fields.is_empty() {
                    diff.unmodified.push(s.clone());
                } else {
                    s.updated_at = now;
                    diff.modified.push(ModifiedRepo {
                        repo: s.clone(),
                        fields,
                    });
                }
            }
            None => {
                if let Some(&ni) = name_index.get(&o.folded_name()) {
                    if claimed.contains(&ni) {
                        // The occupier is the same-named stored repo of a
                        // different identity that survives this pass; the
                        // newcomer loses and is dropped from the batch.
                        continue;
                    }
                    collided.insert(ni);
                }

                if o.created_at == DateTime::UNIX_EPOCH {
                    o.created_at = now;
                }
                o.updated_at = now;
                diff.added.push(o);
            }
        }
    }

    // Stored repos never matched lose this sync's source entry; collision
    // casualties go outright.
    for (i, s) in stored.iter_mut().enumerate() {
        if matched.contains(&i) {
            continue;
        }

        if collided.contains(&i) {
            s.soft_delete(now);
            diff.deleted.push(s.clone());
            continue;
        }

        let had_source = s.sources.remove(urn).is_some();
        if s.sources.is_empty() {
            s.soft_delete(now);
            diff.deleted.push(s.clone());
        } else if had_source {
            s.updated_at = now;
            diff.modified.push(ModifiedRepo {
                repo: s.clone(),
                fields: ModifiedFields::SOURCES,
            });
        } else {
            diff.unmodified.push(s.clone());
        }
    }

    diff.sort();
    diff
}

/// Deduplicates by external identity, first occurrence winning (adapters
/// stream newest-first on purpose). Two distinct identities colliding on a
/// case-folded name within the batch resolve deterministically: the smaller
/// identity keeps the name, the other is dropped.
fn dedupe_observed(observed: Vec<Repo>) -> Vec<Repo> {
    let mut out: Vec<Repo> = Vec::with_capacity(observed.len());
    let mut seen_ids = HashSet::new();
    let mut name_owner: HashMap<String, usize> = HashMap::new();

    for o in observed {
        if o.external_repo.is_set() && !seen_ids.insert(o.external_repo.clone()) {
            continue;
        }

        match name_owner.entry(o.folded_name()) {
            Entry::Occupied(e) => {
                let idx = *e.get();
                if o.external_repo < out[idx].external_repo {
                    out[idx] = o;
                }
            }
            Entry::Vacant(v) => {
                v.insert(out.len());
                out.push(o);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{ExternalRepoSpec, SourceInfo};

    const URN: &str = "extsvc:github:1";
    const OTHER_URN: &str = "extsvc:gitlab:2";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn observed(name: &str, ext_id: &str) -> Repo {
        let mut sources = HashMap::new();
        sources.insert(
            URN.to_string(),
            SourceInfo {
                id: ext_id.to_string(),
                clone_url: format!("https://{name}.git"),
            },
        );
        Repo {
            name: name.to_string(),
            external_repo: ExternalRepoSpec::new(ext_id, "github", "https://github.com/"),
            sources,
            ..Default::default()
        }
    }

    fn stored(id: i64, name: &str, ext_id: &str) -> Repo {
        let mut r = observed(name, ext_id);
        r.id = id;
        r.created_at = now() - chrono::Duration::days(30);
        r.updated_at = r.created_at;
        r
    }

    fn apply(d: &Diff) -> Vec<Repo> {
        let mut next: Vec<Repo> = Vec::new();
        next.extend(d.added.iter().cloned());
        next.extend(d.modified.iter().map(|m| m.repo.clone()));
        next.extend(d.unmodified.iter().cloned());
        for (i, r) in next.iter_mut().enumerate() {
            if r.id == 0 {
                r.id = 1000 + i as i64;
            }
        }
        next
    }

    #[test]
    fn test_all_new_batch_is_added() {
        let d = diff(URN, vec![], vec![observed("g/a", "1"), observed("g/b", "2")], now());

        assert_eq!(d.added.len(), 2);
        assert!(d.modified.is_empty());
        assert!(d.deleted.is_empty());
        assert_eq!(d.added[0].created_at, now());
    }

    #[test]
    fn test_idempotence() {
        let stored_batch = vec![stored(1, "g/a", "1")];
        let observed_batch = vec![observed("g/a", "1"), observed("g/b", "2")];

        let first = diff(URN, stored_batch, observed_batch.clone(), now());
        let second = diff(URN, apply(&first), observed_batch, now());

        assert!(second.added.is_empty());
        assert!(second.modified.is_empty());
        assert!(second.deleted.is_empty());
        assert_eq!(second.unmodified.len(), 2);
    }

    #[test]
    fn test_identity_over_name_rename_is_single_modified() {
        let d = diff(URN, vec![stored(1, "g/old", "1")], vec![observed("g/new", "1")], now());

        assert!(d.added.is_empty());
        assert!(d.deleted.is_empty());
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].repo.name, "g/new");
        assert!(d.modified[0].fields.contains(ModifiedFields::NAME));
        assert_eq!(d.modified[0].repo.updated_at, now());
    }

    #[test]
    fn test_case_only_rename_updates_column_without_name_bit() {
        let mut o = observed("g/A", "1");
        o.archived = true;

        let d = diff(URN, vec![stored(1, "g/a", "1")], vec![o], now());

        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].repo.name, "g/A");
        assert!(!d.modified[0].fields.contains(ModifiedFields::NAME));
        assert!(d.modified[0].fields.contains(ModifiedFields::ARCHIVED));
    }

    #[test]
    fn test_observed_case_duplicates_collapse() {
        let d = diff(URN, vec![], vec![observed("g/a", "1"), observed("g/A", "1")], now());

        assert_eq!(d.added.len(), 1, "same identity must not yield two entries");
    }

    #[test]
    fn test_observed_name_clash_resolves_to_smaller_identity() {
        let d = diff(URN, vec![], vec![observed("g/a", "2"), observed("g/A", "1")], now());

        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].external_repo.id, "1");
    }

    #[test]
    fn test_duplicate_identity_first_occurrence_wins() {
        let mut second = observed("g/other", "1");
        second.description = "late duplicate".to_string();

        let d = diff(URN, vec![], vec![observed("g/a", "1"), second], now());

        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].name, "g/a");
    }

    #[test]
    fn test_collision_deletes_occupier_and_adds_newcomer() {
        let d = diff(URN, vec![stored(1, "g/a", "1")], vec![observed("g/A", "2")], now());

        assert_eq!(d.deleted.len(), 1);
        assert_eq!(d.deleted[0].id, 1);
        assert!(d.deleted[0].is_deleted());
        assert!(d.deleted[0].sources.is_empty());
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].external_repo.id, "2");
    }

    #[test]
    fn test_rename_onto_occupied_name_deletes_occupier() {
        let stored_batch = vec![stored(1, "g/a", "1"), stored(2, "g/b", "2")];
        // Repo 1 renames to g/b while repo 2 is absent from the batch.
        let d = diff(URN, stored_batch, vec![observed("g/b", "1")], now());

        assert_eq!(d.deleted.len(), 1);
        assert_eq!(d.deleted[0].id, 2);
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].repo.id, 1);
        assert_eq!(d.modified[0].repo.name, "g/b");
    }

    #[test]
    fn test_swap_safety() {
        let stored_batch = vec![stored(1, "g/a", "1"), stored(2, "g/b", "2")];
        let observed_batch = vec![observed("g/b", "1"), observed("g/a", "2")];

        let d = diff(URN, stored_batch, observed_batch, now());

        assert!(d.deleted.is_empty(), "a swap must never delete");
        assert!(d.added.is_empty());
        assert_eq!(d.modified.len(), 2);
        assert!(
            d.modified
                .iter()
                .all(|m| m.fields.contains(ModifiedFields::NAME))
        );
    }

    #[test]
    fn test_newcomer_dropped_when_name_kept_by_identity_match() {
        // Stored repo 1 keeps its name via identity; the same-named newcomer
        // with a fresh identity is dropped rather than deleting it.
        let d = diff(
            URN,
            vec![stored(1, "g/a", "1")],
            vec![observed("g/a", "1"), observed("g/A", "9")],
            now()
        );

        assert!(d.deleted.is_empty());
        assert!(d.added.is_empty());
        assert_eq!(d.unmodified.len(), 1);
    }

    #[test]
    fn test_absent_repo_with_single_source_is_deleted() {
        let d = diff(URN, vec![stored(1, "g/a", "1")], vec![], now());

        assert_eq!(d.deleted.len(), 1);
        assert_eq!(d.deleted[0].deleted_at, Some(now()));
    }

    #[test]
    fn test_multi_source_repo_survives_one_source_loss() {
        let mut multi = stored(1, "g/a", "1");
        multi.sources.insert(
            OTHER_URN.to_string(),
            SourceInfo {
                id: "77".to_string(),
                clone_url: "https://gitlab.example.com/g/a.git".to_string(),
            },
        );

        let d = diff(URN, vec![multi], vec![], now());

        assert!(d.deleted.is_empty());
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].fields, ModifiedFields::SOURCES);
        let survivor = &d.modified[0].repo;
        assert!(!survivor.sources.contains_key(URN));
        assert!(survivor.sources.contains_key(OTHER_URN));
    }

    #[test]
    fn test_observed_merges_source_entry_additively() {
        let mut multi = stored(1, "g/a", "1");
        multi.sources.insert(
            OTHER_URN.to_string(),
            SourceInfo {
                id: "77".to_string(),
                clone_url: "https://gitlab.example.com/g/a.git".to_string(),
            },
        );

        let d = diff(URN, vec![multi], vec![observed("g/a", "1")], now());

        assert_eq!(d.unmodified.len(), 1);
        assert_eq!(d.unmodified[0].sources.len(), 2);
    }

    #[test]
    fn test_tombstones_are_not_part_of_matching() {
        // A previously deleted row never reaches the engine: stored input is
        // live rows only, so the reappearing identity is a plain Added.
        let d = diff(URN, vec![], vec![observed("g/a", "1")], now());

        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].id, 0, "fresh record, not a revival");
    }

    #[test]
    fn test_diff_output_is_sorted() {
        let observed_batch = vec![observed("g/c", "3"), observed("g/a", "1"), observed("g/b", "2")];
        let d = diff(URN, vec![], observed_batch, now());

        let ids: Vec<&str> = d.added.iter().map(|r| r.external_repo.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }
}
