use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use festival_sync::config::{self, BuildContext, Config};
use festival_sync::model::{Day, EventKind, TimeOfDay};
use festival_sync::nocodb::{FetchError, PageQuery, RowPage, TableService};
use festival_sync::output::{EVENTS_BY_DAY_FILE, EVENTS_FILE};
use festival_sync::pipeline::{load_events, Pipeline, RunOptions};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct RecordingTables {
    pages: Arc<Mutex<HashMap<String, VecDeque<Result<RowPage, FetchError>>>>>,
    list_calls: Arc<Mutex<Vec<(String, u64, u32)>>>,
}

impl RecordingTables {
    async fn queue(&self, table: &str, page: Result<RowPage, FetchError>) {
        self.pages
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push_back(page);
    }

    async fn queue_rows(&self, table: &str, rows: Vec<Value>) {
        self.queue(table, Ok(RowPage { rows, ..Default::default() })).await;
    }

    async fn list_calls(&self) -> Vec<(String, u64, u32)> {
        self.list_calls.lock().await.clone()
    }

    async fn offsets(&self, table: &str) -> Vec<u64> {
        self.list_calls()
            .await
            .into_iter()
            .filter(|(t, _, _)| t == table)
            .map(|(_, offset, _)| offset)
            .collect()
    }
}

#[async_trait::async_trait]
impl TableService for RecordingTables {
    async fn list_rows(&self, table: &str, query: &PageQuery) -> Result<RowPage, FetchError> {
        self.list_calls
            .lock()
            .await
            .push((table.to_string(), query.offset, query.limit));
        let mut pages = self.pages.lock().await;
        pages
            .get_mut(table)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(RowPage::default()))
    }

    async fn count_rows(&self, _table: &str, _filter: Option<&str>) -> Result<u64, FetchError> {
        Ok(0)
    }
}

const BOOTHS: &str = "NOCODB_BOOTHS_TABLE_ID";
const WORKSHOPS: &str = "NOCODB_WORKSHOPS_TABLE_ID";
const TALKS: &str = "NOCODB_TALKS_TABLE_ID";

fn test_config(root: &Path) -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.app.data_dir = root.join("data").to_string_lossy().to_string();
    cfg.app.public_dir = root.join("public").to_string_lossy().to_string();
    cfg.app.mirror_dir = None;
    cfg.publication.hide_unpublished = Some(false);
    cfg
}

fn workshop(id: u64, title: &str, description: &str, day: Value, time: &str) -> Value {
    json!({
        "ID": id,
        "Choisissez un titre court": title,
        "Décrivez brièvement votre animation pour les visiteurs": description,
        "Jours": day,
        "Heure": time,
        "Statut": "Publié",
    })
}

fn three_workshops() -> Vec<Value> {
    vec![
        workshop(1, "Robots en classe", "Build a robot", json!(2), "14:00:00"),
        workshop(2, "", "Learning to code with blocks for kids", json!(2), "10:30:00"),
        workshop(3, "Atelier micro:bit", "Blink some LEDs", json!(3), ""),
    ]
}

#[tokio::test]
async fn workshop_rows_become_events_and_outputs() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());
    let tables = RecordingTables::default();
    tables.queue_rows(WORKSHOPS, three_workshops()).await;

    let pipeline = Pipeline::new(cfg.clone(), BuildContext::default(), Arc::new(tables.clone()));
    let report = pipeline.run(RunOptions::default()).await.unwrap();

    assert!(!report.degraded);
    assert!(!report.skipped);
    let titles: Vec<&str> = report.events.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Robots en classe", "Learning to code with blocks…", "Atelier micro:bit"]
    );
    let first = &report.events[0];
    assert_eq!(first.id, "workshop-1");
    assert_eq!(first.day, Day::Thursday);
    assert_eq!(first.start_time, TimeOfDay::At("14:00".into()));
    assert_eq!(report.events[2].day, Day::Friday);
    assert_eq!(report.events[2].start_time, TimeOfDay::Undetermined);

    let data = td.path().join("data");
    assert!(data.join(EVENTS_FILE).is_file());
    assert!(data.join("raw-data/workshops_raw.json").is_file());
    let by_day: Value =
        serde_json::from_str(&fs::read_to_string(data.join(EVENTS_BY_DAY_FILE)).unwrap()).unwrap();
    let thursday: Vec<&str> = by_day["thursday"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(thursday, vec!["workshop-2", "workshop-1"]);

    let workshops: Value =
        serde_json::from_str(&fs::read_to_string(data.join("workshops.json")).unwrap()).unwrap();
    assert_eq!(workshops.as_array().unwrap().len(), 3);
    assert_eq!(report.media.as_ref().map(|m| m.processed), Some(0));
}

#[tokio::test]
async fn full_page_then_empty_page_ends_pagination() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());
    let tables = RecordingTables::default();
    let rows: Vec<Value> = (1..=50)
        .map(|i| workshop(i, &format!("Atelier {}", i), "", json!(1), "09:00"))
        .collect();
    tables.queue_rows(WORKSHOPS, rows).await;
    tables.queue_rows(WORKSHOPS, vec![]).await;

    let pipeline = Pipeline::new(cfg, BuildContext::default(), Arc::new(tables.clone()));
    let report = pipeline
        .run(RunOptions { fetch_only: true, ..Default::default() })
        .await
        .unwrap();

    let fetched = report
        .tables
        .iter()
        .find(|t| t.kind == EventKind::Workshop)
        .unwrap();
    assert_eq!(fetched.rows.len(), 50);
    assert_eq!(fetched.changes.added.len(), 50);
    assert_eq!(tables.offsets(WORKSHOPS).await, vec![0, 50]);
    assert!(report.events.is_empty());
}

#[tokio::test]
async fn transient_failure_falls_back_to_snapshot() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());

    let first = RecordingTables::default();
    first
        .queue_rows(TALKS, vec![json!({ "ID": 4, "Choisissez un titre pour la conférence": "IA et école" })])
        .await;
    Pipeline::new(cfg.clone(), BuildContext::default(), Arc::new(first))
        .run(RunOptions::default())
        .await
        .unwrap();

    let second = RecordingTables::default();
    second
        .queue(
            TALKS,
            Err(FetchError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "maintenance".into(),
            }),
        )
        .await;
    let report = Pipeline::new(cfg, BuildContext::default(), Arc::new(second))
        .run(RunOptions { no_reset: true, ..Default::default() })
        .await
        .unwrap();

    assert!(report.degraded);
    let talks = report.tables.iter().find(|t| t.kind == EventKind::Talk).unwrap();
    assert!(talks.degraded);
    assert_eq!(talks.rows.len(), 1);
    assert!(talks.changes.is_empty());
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].title, "IA et école");
}

#[tokio::test]
async fn transient_failure_without_snapshot_yields_empty_table() {
    let td = tempfile::tempdir().unwrap();
    let tables = RecordingTables::default();
    tables
        .queue(
            BOOTHS,
            Err(FetchError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: String::new(),
            }),
        )
        .await;
    let report = Pipeline::new(test_config(td.path()), BuildContext::default(), Arc::new(tables))
        .run(RunOptions { fetch_only: true, ..Default::default() })
        .await
        .unwrap();
    assert!(report.degraded);
    let booths = report.tables.iter().find(|t| t.kind == EventKind::Booth).unwrap();
    assert!(booths.rows.is_empty());
}

#[tokio::test]
async fn structural_error_aborts_run() {
    let td = tempfile::tempdir().unwrap();
    let tables = RecordingTables::default();
    tables
        .queue(
            TALKS,
            Err(FetchError::Structural {
                table: TALKS.into(),
                detail: "list is not an array".into(),
            }),
        )
        .await;
    let err = Pipeline::new(test_config(td.path()), BuildContext::default(), Arc::new(tables))
        .run(RunOptions::default())
        .await
        .unwrap_err();
    let fetch = err.downcast_ref::<FetchError>().unwrap();
    assert!(fetch.is_fatal());
    assert!(!td.path().join("data").join(EVENTS_FILE).exists());
}

#[tokio::test]
async fn unchanged_tables_skip_generation_unless_forced() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());

    let run = |opts: RunOptions| {
        let cfg = cfg.clone();
        async move {
            let tables = RecordingTables::default();
            tables.queue_rows(WORKSHOPS, three_workshops()).await;
            Pipeline::new(cfg, BuildContext::default(), Arc::new(tables))
                .run(opts)
                .await
                .unwrap()
        }
    };

    let first = run(RunOptions::default()).await;
    assert!(!first.skipped);
    assert_eq!(first.total_changes(), 3);

    let second = run(RunOptions::default()).await;
    assert!(second.skipped);
    assert_eq!(second.total_changes(), 0);
    assert!(second.events.is_empty());

    let forced = run(RunOptions { no_reset: true, ..Default::default() }).await;
    assert!(!forced.skipped);
    assert_eq!(forced.events.len(), 3);
}

#[tokio::test]
async fn primary_production_hides_pending_rows() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());
    let mut rows = three_workshops();
    rows[2]["Statut"] = json!("En attente");

    let tables = RecordingTables::default();
    tables.queue_rows(WORKSHOPS, rows).await;
    let build = BuildContext {
        production: true,
        branch: Some("main".into()),
    };
    let report = Pipeline::new(cfg, build, Arc::new(tables))
        .run(RunOptions::default())
        .await
        .unwrap();
    let ids: Vec<&str> = report.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["workshop-1", "workshop-2"]);
}

#[tokio::test]
async fn booths_are_shared_across_days() {
    let td = tempfile::tempdir().unwrap();
    let tables = RecordingTables::default();
    tables
        .queue_rows(
            BOOTHS,
            vec![json!({
                "ID": 9,
                "Choisissez un titre court": "Stand robotique",
                "Jours": 0,
            })],
        )
        .await;
    let report = Pipeline::new(test_config(td.path()), BuildContext::default(), Arc::new(tables))
        .run(RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.events.len(), 1);
    let booth = &report.events[0];
    assert!(booth.shared);
    assert_eq!(booth.start_time, TimeOfDay::AllDay);

    let by_day: Value = serde_json::from_str(
        &fs::read_to_string(td.path().join("data").join(EVENTS_BY_DAY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(by_day["allDays"].as_array().unwrap().len(), 1);
    assert!(by_day["wednesday"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn load_events_dedupes_without_disk() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());
    let tables = RecordingTables::default();
    tables
        .queue_rows(
            WORKSHOPS,
            vec![
                workshop(1, "Robotique pour tous", "", json!(2), "14:00"),
                workshop(2, "Robotique pour tous !", "", json!(2), "15:00"),
                workshop(3, "Robotique pour tous", "", json!(3), "14:00"),
            ],
        )
        .await;

    let events = load_events(&tables, &cfg, false).await.unwrap();
    let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["workshop-1", "workshop-3"]);
    assert!(!td.path().join("data").exists());
    assert_eq!(tables.list_calls().await.len(), 3);
}

#[tokio::test]
async fn failed_write_keeps_previous_snapshot() {
    let td = tempfile::tempdir().unwrap();
    let cfg = test_config(td.path());
    let data = td.path().join("data");

    let run = |rows: Vec<Value>| {
        let cfg = cfg.clone();
        async move {
            let tables = RecordingTables::default();
            tables.queue_rows(WORKSHOPS, rows).await;
            Pipeline::new(cfg, BuildContext::default(), Arc::new(tables))
                .run(RunOptions::default())
                .await
        }
    };

    run(three_workshops()).await.unwrap();
    let mut edited = three_workshops();
    edited[0]["Choisissez un titre court"] = json!("Robots au musée");

    // A directory in place of talks.json makes the final rename fail.
    fs::remove_file(data.join("talks.json")).unwrap();
    fs::create_dir(data.join("talks.json")).unwrap();
    assert!(run(edited.clone()).await.is_err());
    let kept = fs::read_to_string(data.join("raw-data/workshops_raw.json")).unwrap();
    assert!(kept.contains("Robots en classe"));
    assert!(!kept.contains("Robots au musée"));

    fs::remove_dir(data.join("talks.json")).unwrap();
    fs::write(data.join("talks.json"), "[]").unwrap();
    let report = run(edited).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.total_changes(), 1);
    assert_eq!(report.events[0].title, "Robots au musée");
    let saved = fs::read_to_string(data.join("raw-data/workshops_raw.json")).unwrap();
    assert!(saved.contains("Robots au musée"));
}

#[tokio::test]
async fn booth_listed_on_several_days_is_kept_once() {
    let td = tempfile::tempdir().unwrap();
    let tables = RecordingTables::default();
    tables
        .queue_rows(
            BOOTHS,
            vec![
                json!({ "ID": 3, "Choisissez un titre court": "Fablab Namur", "Jours": 1 }),
                json!({ "ID": 7, "Choisissez un titre court": "Fablab Namur", "Jours": 2 }),
            ],
        )
        .await;
    let report = Pipeline::new(test_config(td.path()), BuildContext::default(), Arc::new(tables))
        .run(RunOptions::default())
        .await
        .unwrap();
    let ids: Vec<&str> = report.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["booth-3"]);
    assert_eq!(report.discards.len(), 1);
}
