//! External agent tests using small `sh` agents.
#![cfg(unix)]

use lfs_transfer::{
    Direction, Error, HttpClient, Link, Manifest, ObjectRef, ObjectStore, Oid, ProgressCallback,
    TransferAdapter, TransferConfig, TransferResult,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Agent serving every download from `$1/content` and logging each request
/// line to `$1/requests.log`.
const AGENT: &str = r#"
dir="$1"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$dir/requests.log"
  oid=$(printf '%s' "$line" | sed -n 's/.*"oid":"\([0-9a-f]*\)".*/\1/p')
  case "$line" in
    *'"event":"init"'*)
      echo '{}' ;;
    *'"event":"download"'*)
      cp "$dir/content" "$dir/$oid.part"
      size=$(wc -c < "$dir/content" | tr -d ' ')
      echo "{\"event\":\"progress\",\"oid\":\"$oid\",\"bytesSoFar\":$size,\"bytesSinceLast\":$size}"
      echo "{\"event\":\"complete\",\"oid\":\"$oid\",\"path\":\"$dir/$oid.part\"}" ;;
    *'"event":"upload"'*)
      echo "{\"event\":\"progress\",\"oid\":\"$oid\",\"bytesSoFar\":1,\"bytesSinceLast\":1}"
      echo "{\"event\":\"progress\",\"oid\":\"$oid\",\"bytesSoFar\":2,\"bytesSinceLast\":1}"
      echo "{\"event\":\"complete\",\"oid\":\"$oid\"}" ;;
    *'"event":"terminate"'*)
      exit 0 ;;
  esac
done
"#;

/// Agent that refuses to start.
const FAILING_AGENT: &str = r#"
read -r line
echo '{"error":{"code":32,"message":"not today"}}'
"#;

fn write_agent(td: &TempDir, script: &str) -> String {
    let path = td.path().join("agent.sh");
    fs::write(&path, script).unwrap();
    path.display().to_string()
}

fn manifest(td: &TempDir, script: &str, concurrent: bool) -> Manifest {
    let agent = write_agent(td, script);
    let mut cfg = BTreeMap::new();
    cfg.insert("transfer.customtransfer.agent.path".to_string(), "sh".to_string());
    cfg.insert(
        "transfer.customtransfer.agent.args".to_string(),
        format!("{} {}", agent, td.path().display()),
    );
    cfg.insert(
        "transfer.customtransfer.agent.concurrent".to_string(),
        concurrent.to_string(),
    );
    let config = TransferConfig::from_source(&cfg);
    Manifest::configure(&config, ObjectStore::new(td.path().join("lfs")), HttpClient::default())
}

fn run(adapter: &mut dyn TransferAdapter, objects: Vec<ObjectRef>) -> Vec<TransferResult> {
    run_with_progress(adapter, None, objects)
}

fn run_with_progress(
    adapter: &mut dyn TransferAdapter,
    progress: Option<ProgressCallback>,
    objects: Vec<ObjectRef>,
) -> Vec<TransferResult> {
    let (tx, rx) = crossbeam_channel::unbounded();
    adapter.begin(4, progress, Some(tx)).unwrap();
    for object in objects {
        adapter.add(object).unwrap();
    }
    adapter.end();
    rx.iter().collect()
}

fn requests(td: &TempDir) -> Vec<String> {
    fs::read_to_string(td.path().join("requests.log"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

fn download_object(dest: &Path, content: &[u8]) -> ObjectRef {
    ObjectRef::new("obj.bin", Oid::from_content(content), content.len() as u64, dest)
        .with_link(Link::new("https://lfs.example.com/obj"))
}

#[test]
fn test_custom_download() {
    let td = TempDir::new().unwrap();
    let content = b"delivered by an external agent";
    fs::write(td.path().join("content"), content).unwrap();
    let manifest = manifest(&td, AGENT, false);
    let mut adapter = manifest.new_download_adapter("agent").unwrap();
    assert_eq!(adapter.name(), "agent");

    let dest = td.path().join("out").join("obj.bin");
    let results = run(adapter.as_mut(), vec![download_object(&dest, content)]);

    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok(), "{:?}", results[0].error);
    assert_eq!(fs::read(&dest).unwrap(), content);

    let lines = requests(&td);
    // concurrent=false means a single agent process.
    assert_eq!(lines.iter().filter(|l| l.contains(r#""event":"init""#)).count(), 1);
    assert!(lines[0].contains(r#""operation":"download""#));
    assert!(lines[0].contains(r#""concurrenttransfers":4"#));
    assert!(lines.last().unwrap().contains(r#""event":"terminate""#));
}

#[test]
fn test_custom_download_hash_mismatch() {
    let td = TempDir::new().unwrap();
    fs::write(td.path().join("content"), b"not what was asked for").unwrap();
    let manifest = manifest(&td, AGENT, true);
    let mut adapter = manifest.new_download_adapter("agent").unwrap();

    let dest = td.path().join("obj.bin");
    let results = run(adapter.as_mut(), vec![download_object(&dest, b"expected content")]);

    assert!(matches!(results[0].error, Some(Error::Integrity { .. })));
    assert!(!dest.exists());
}

#[test]
fn test_custom_upload() {
    let td = TempDir::new().unwrap();
    let source = td.path().join("source.bin");
    fs::write(&source, b"upload me").unwrap();
    let manifest = manifest(&td, AGENT, true);
    let mut adapter = manifest.new_upload_adapter("agent").unwrap();
    assert_eq!(adapter.direction(), Direction::Upload);

    let object = ObjectRef::new("source.bin", Oid::from_content(b"upload me"), 9, &source)
        .with_link(Link::new("https://lfs.example.com/up"));
    let results = run(adapter.as_mut(), vec![object]);

    assert!(results[0].is_ok(), "{:?}", results[0].error);
    let upload = requests(&td)
        .into_iter()
        .find(|l| l.contains(r#""event":"upload""#))
        .unwrap();
    assert!(upload.contains(&format!(r#""path":"{}""#, source.display())), "{upload}");
}

#[test]
fn test_progress_error_fails_only_its_object() {
    let td = TempDir::new().unwrap();
    let manifest = manifest(&td, AGENT, false);
    let mut adapter = manifest.new_upload_adapter("agent").unwrap();

    let objects: Vec<ObjectRef> = ["a", "b"]
        .iter()
        .map(|name| {
            let source = td.path().join(name);
            fs::write(&source, name).unwrap();
            ObjectRef::new(*name, Oid::from_content(name.as_bytes()), 1, &source)
                .with_link(Link::new("https://lfs.example.com/up"))
        })
        .collect();
    let progress: ProgressCallback = Arc::new(|name: &str, _: u64, _: u64, _: usize| {
        if name == "a" {
            return Err(Error::Http("abort".into()));
        }
        Ok(())
    });
    let results = run_with_progress(adapter.as_mut(), Some(progress), objects);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].object.name(), "a");
    assert!(matches!(&results[0].error, Some(Error::Http(m)) if m == "abort"), "{:?}", results[0].error);
    assert_eq!(results[1].object.name(), "b");
    assert!(results[1].is_ok(), "{:?}", results[1].error);
}

#[test]
fn test_failed_init_aborts_begin() {
    let td = TempDir::new().unwrap();
    let manifest = manifest(&td, FAILING_AGENT, true);
    let mut adapter = manifest.new_download_adapter("agent").unwrap();

    let err = adapter.begin(2, None, None).unwrap_err();
    assert!(err.to_string().contains("not today"), "{err}");
    assert!(adapter.add(download_object(&td.path().join("x"), b"x")).is_err());
}
