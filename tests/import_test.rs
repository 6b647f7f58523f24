use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugin_apple_notes::{AppleNote, AppleNotesPlugin, NoteReader};
use plugin_obsidian::ObsidianPlugin;
use reorg::ai::Unconfigured;
use reorg::plugin::{InProcessLauncher, ManagerConfig, PluginManager};
use reorg::store::{MemoryStore, Store};
use reorg_plugin::import::content_hash;
use reorg_plugin::{ExecuteParams, ItemAction};

#[derive(Clone)]
struct FixedNotes(Vec<AppleNote>);

#[async_trait]
impl NoteReader for FixedNotes {
    async fn read_notes(&self, _since: Duration) -> anyhow::Result<Vec<AppleNote>> {
        Ok(self.0.clone())
    }
}

fn note(id: &str, name: &str, body: &str) -> AppleNote {
    AppleNote {
        id: id.into(),
        name: name.into(),
        body: body.into(),
        folder: "Notes".into(),
        ..Default::default()
    }
}

fn manager(state_dir: &std::path::Path, launcher: InProcessLauncher, store: Arc<MemoryStore>) -> PluginManager {
    PluginManager::new(
        Arc::new(launcher),
        store,
        Arc::new(Unconfigured),
        ManagerConfig { state_dir: state_dir.to_path_buf(), log_dir: None, log_level: "info".into() },
    )
}

fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn unchanged_notes_are_skipped_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let groceries = note("x-coredata://1", "Groceries", "<div>eggs, milk</div>");
    let trip = note("x-coredata://2", "Trip ideas", "<div>Lisbon in May</div>");

    // the first note was imported by an earlier run
    let state_dir = dir.path().join("plugins").join("apple-notes");
    std::fs::create_dir_all(&state_dir).unwrap();
    let processed = HashMap::from([(groceries.id.clone(), content_hash(&groceries.plain_text()))]);
    let state = serde_json::json!({ "processed_notes": processed });
    std::fs::write(state_dir.join("state.json"), state.to_string()).unwrap();

    let reader = FixedNotes(vec![groceries, trip]);
    let launcher = InProcessLauncher::new()
        .register("apple-notes", move || AppleNotesPlugin::with_reader(reader.clone()));
    let store = Arc::new(MemoryStore::new());
    let manager = manager(dir.path(), launcher, store.clone());

    manager.load("apple-notes", config(&[("since", "24h")])).await.unwrap();
    let res = manager.execute("apple-notes", &ExecuteParams::dry_run(false)).await.unwrap();

    assert!(res.success);
    assert_eq!(res.summary.items_processed, 2);
    assert_eq!(res.summary.items_imported, 1);
    assert_eq!(res.summary.items_skipped, 1);
    assert_eq!(res.summary.items_failed, 0);
    assert_eq!(res.summary.message, "Processed 2 notes from Apple Notes");
    assert_eq!(res.results[0].action, ItemAction::Skipped);
    assert_eq!(res.results[1].metadata.get("folder").map(String::as_str), Some("Notes"));

    let areas = store.list_areas().await.unwrap();
    assert_eq!(areas.len(), 1);
    assert_eq!(areas[0].title, "Personal");
    let projects = store.list_all_projects().await.unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].title, "Trip ideas");

    // both notes are now recorded
    let res = manager.execute("apple-notes", &ExecuteParams::dry_run(false)).await.unwrap();
    assert_eq!(res.summary.items_skipped, 2);
    assert_eq!(store.list_all_projects().await.unwrap().len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn dry_run_leaves_store_and_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let reader = FixedNotes(vec![note("1", "One", "first"), note("2", "Two", "second")]);
    let launcher = InProcessLauncher::new()
        .register("apple-notes", move || AppleNotesPlugin::with_reader(reader.clone()));
    let store = Arc::new(MemoryStore::new());
    let manager = manager(dir.path(), launcher, store.clone());

    manager.load("apple-notes", HashMap::new()).await.unwrap();
    let res = manager.execute("apple-notes", &ExecuteParams::dry_run(true)).await.unwrap();

    assert!(res.success);
    assert_eq!(res.summary.items_imported, 2);
    assert!(store.list_areas().await.unwrap().is_empty());
    assert!(!dir.path().join("plugins").join("apple-notes").join("state.json").exists());

    // a real run afterwards still sees both notes as new
    let res = manager.execute("apple-notes", &ExecuteParams::dry_run(false)).await.unwrap();
    assert_eq!(res.summary.items_imported, 2);
    assert!(dir.path().join("plugins").join("apple-notes").join("state.json").exists());
}

#[tokio::test]
async fn obsidian_vault_import_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let vault = dir.path().join("vault");
    std::fs::create_dir_all(vault.join("Projects")).unwrap();
    std::fs::create_dir_all(vault.join(".obsidian")).unwrap();
    std::fs::write(
        vault.join("Projects").join("Garden.md"),
        "---\ntags:\n  - home\n---\nPlant tomatoes #spring\n",
    )
    .unwrap();
    std::fs::write(vault.join("Reading.md"), "Finish [[Dune]]\n").unwrap();
    std::fs::write(vault.join(".obsidian").join("workspace.md"), "ignored").unwrap();

    let launcher = InProcessLauncher::new().register("obsidian", ObsidianPlugin::default);
    let store = Arc::new(MemoryStore::new());
    let state_dir = dir.path().join("state");
    let manager = manager(&state_dir, launcher, store.clone());

    let vault_path = vault.to_string_lossy().to_string();
    manager
        .load("obsidian", config(&[("vault_path", &vault_path), ("since", "")]))
        .await
        .unwrap();

    let res = manager.execute("obsidian", &ExecuteParams::default()).await.unwrap();
    assert!(res.success, "{:?}", res.error);
    assert_eq!(res.summary.items_processed, 2);
    assert_eq!(res.summary.items_imported, 2);
    assert_eq!(res.summary.message, "Processed 2 notes from Obsidian vault");
    let mut paths: Vec<_> = res.results.iter().filter_map(|r| r.metadata.get("path").cloned()).collect();
    paths.sort();
    assert_eq!(paths, vec!["Projects/Garden.md", "Reading.md"]);

    let projects = store.list_all_projects().await.unwrap();
    assert_eq!(projects.len(), 2);
    let garden = projects.iter().find(|p| p.tags.contains(&"home".to_string())).unwrap();
    assert!(garden.tags.contains(&"spring".to_string()));

    let res = manager.execute("obsidian", &ExecuteParams::default()).await.unwrap();
    assert_eq!(res.summary.items_skipped, 2);
    assert_eq!(res.summary.items_imported, 0);

    manager.unload("obsidian").await.unwrap();
}

#[tokio::test]
async fn obsidian_without_vault_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = InProcessLauncher::new().register("obsidian", ObsidianPlugin::default);
    let manager = manager(dir.path(), launcher, Arc::new(MemoryStore::new()));

    manager.load("obsidian", HashMap::new()).await.unwrap();
    let res = manager.execute("obsidian", &ExecuteParams::default()).await.unwrap();
    assert!(!res.success);
    assert_eq!(res.error.as_deref(), Some("vault_path not configured"));
}
