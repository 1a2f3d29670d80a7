//! Feedstock discovery and graph refresh.
//!
//! `gather-all-feedstocks` pulls the organization's repository list from
//! the forge and reconciles it with the store: new feedstocks get a
//! skeleton package record (the discovery pass fills in recipe details),
//! archived ones are tombstoned in place. `make-graph` rebuilds the
//! dependency graph from the records and persists it for the other verbs.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::forge::ForgeGateway;
use crate::graph::{GRAPH_KEY, GraphDoc, PackageGraph};
use crate::scheduler::Reporter;
use crate::store::GraphStore;
use crate::types::{NODE_PREFIX, PackageRecord, node_key};

/// Store key of the flat feedstock listing.
pub const FEEDSTOCKS_KEY: &str = "feedstocks/all";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GatherStats {
    pub known: u64,
    pub added: u64,
    pub tombstoned: u64,
}

/// Refresh the known-feedstock list from the forge.
pub fn gather_all_feedstocks(
    store: &GraphStore,
    forge: &dyn ForgeGateway,
    reporter: &mut dyn Reporter,
) -> Result<GatherStats> {
    let mut stats = GatherStats::default();
    let listing = forge.list_feedstocks()?;

    let mut names: BTreeSet<String> = BTreeSet::new();
    for (feedstock, archived) in listing {
        let package = feedstock
            .strip_suffix("-feedstock")
            .unwrap_or(&feedstock)
            .to_string();
        names.insert(feedstock.clone());
        stats.known += 1;

        let mut scope = store.write_scope::<PackageRecord>(&node_key(&package))?;
        let known_as = scope.load()?.map(|existing| existing.archived);
        match known_as {
            Some(was_archived) => {
                if was_archived != archived {
                    // Removal is tombstoning: the key stays, the flag flips.
                    scope.get_mut()?.archived = archived;
                    if archived {
                        stats.tombstoned += 1;
                        reporter.info(&format!("{package}: tombstoned (feedstock archived)"));
                    }
                }
            }
            None => {
                let mut record = PackageRecord::new(&package);
                record.feedstock_name = feedstock;
                record.archived = archived;
                scope.set(record);
                stats.added += 1;
            }
        }
        scope.commit()?;
    }

    let listing_doc: Vec<String> = names.into_iter().collect();
    store.put(FEEDSTOCKS_KEY, &listing_doc)?;
    reporter.info(&format!(
        "feedstocks: {} known, {} added, {} tombstoned",
        stats.known, stats.added, stats.tombstoned
    ));
    Ok(stats)
}

/// Build or refresh the dependency graph.
///
/// With `update_nodes_and_edges` (or when no graph document exists yet) the
/// graph is rebuilt from every package record and persisted; otherwise the
/// stored document is loaded as-is.
pub fn make_graph(store: &GraphStore, update_nodes_and_edges: bool) -> Result<PackageGraph> {
    if !update_nodes_and_edges {
        if let Some(doc) = store.load::<GraphDoc>(GRAPH_KEY)? {
            return Ok(PackageGraph::from_doc(&doc));
        }
    }

    let prefix = format!("{NODE_PREFIX}/");
    let mut records: Vec<PackageRecord> = Vec::new();
    for key in store.keys_prefix(&prefix)? {
        if let Some(record) = store.load::<PackageRecord>(&key)? {
            records.push(record);
        }
    }
    let graph = PackageGraph::from_records(records.iter());
    store.put(GRAPH_KEY, &graph.to_doc())?;
    Ok(graph)
}

/// Load the persisted graph, rebuilding it when absent.
pub fn load_graph(store: &GraphStore) -> Result<PackageGraph> {
    make_graph(store, false)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use gardener_shard::ShardScheme;
    use tempfile::tempdir;

    use super::*;
    use crate::backends::FileBackend;
    use crate::forge::fake::FakeForge;
    use crate::scheduler::NullReporter;

    fn store_at(root: &Path) -> GraphStore {
        GraphStore::from_backends(
            vec![Box::new(FileBackend::new(root.to_path_buf(), ShardScheme::new(2)))],
            root.to_path_buf(),
            ShardScheme::new(2),
            None,
        )
        .expect("store")
    }

    #[test]
    fn gather_creates_skeleton_records_for_new_feedstocks() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        forge.seed_recipe("zlib-feedstock", "x");
        forge.seed_recipe("numpy-feedstock", "x");

        let stats = gather_all_feedstocks(&store, &forge, &mut NullReporter).expect("gather");
        assert_eq!(stats.known, 2);
        assert_eq!(stats.added, 2);

        let record: PackageRecord = store.load(&node_key("zlib")).expect("load").expect("present");
        assert_eq!(record.feedstock_name, "zlib-feedstock");
        assert!(!record.archived);

        let listing: Vec<String> = store.load(FEEDSTOCKS_KEY).expect("load").expect("present");
        assert_eq!(listing, vec!["numpy-feedstock", "zlib-feedstock"]);
    }

    #[test]
    fn gather_tombstones_archived_feedstocks_in_place() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        forge.seed_recipe("dead-feedstock", "x");

        gather_all_feedstocks(&store, &forge, &mut NullReporter).expect("first gather");
        forge.archive("dead-feedstock");

        let stats = gather_all_feedstocks(&store, &forge, &mut NullReporter).expect("second gather");
        assert_eq!(stats.tombstoned, 1);

        // The key remains; only the flag flips.
        let record: PackageRecord = store.load(&node_key("dead")).expect("load").expect("present");
        assert!(record.archived);
    }

    #[test]
    fn gather_preserves_existing_record_fields() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        let forge = FakeForge::new();
        forge.seed_recipe("zlib-feedstock", "x");

        let mut record = PackageRecord::new("zlib");
        record.version = Some("1.3".to_string());
        store.put(&node_key("zlib"), &record).expect("seed");

        gather_all_feedstocks(&store, &forge, &mut NullReporter).expect("gather");
        let stored: PackageRecord = store.load(&node_key("zlib")).expect("load").expect("present");
        assert_eq!(stored.version.as_deref(), Some("1.3"));
    }

    #[test]
    fn make_graph_persists_and_reloads() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());

        let mut zlib = PackageRecord::new("zlib");
        zlib.version = Some("1.3".to_string());
        store.put(&node_key("zlib"), &zlib).expect("seed");
        let mut libpng = PackageRecord::new("libpng");
        libpng.requirements.host.insert("zlib".to_string());
        store.put(&node_key("libpng"), &libpng).expect("seed");

        let graph = make_graph(&store, true).expect("build");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.successors("zlib"), vec!["libpng"]);

        // A plain load round-trips through the persisted document.
        let reloaded = load_graph(&store).expect("load");
        assert_eq!(reloaded.to_doc(), graph.to_doc());
    }

    #[test]
    fn make_graph_rebuilds_when_no_document_exists() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        store.put(&node_key("solo"), &PackageRecord::new("solo")).expect("seed");

        let graph = load_graph(&store).expect("load rebuilds");
        assert!(graph.contains("solo"));
        assert!(store.exists(GRAPH_KEY).expect("persisted"));
    }

    #[test]
    fn refresh_picks_up_new_edges() {
        let td = tempdir().expect("tempdir");
        let store = store_at(td.path());
        store.put(&node_key("a"), &PackageRecord::new("a")).expect("seed");
        make_graph(&store, true).expect("build");

        let mut b = PackageRecord::new("b");
        b.requirements.run.insert("a".to_string());
        store.put(&node_key("b"), &b).expect("seed");

        let stale = load_graph(&store).expect("stale load");
        assert!(!stale.contains("b"));

        let fresh = make_graph(&store, true).expect("refresh");
        assert!(fresh.contains("b"));
        assert_eq!(fresh.successors("a"), vec!["b"]);
    }
}
