//! Cross-process tests driving the `warp-shmd` binary
//!
//! The store runs inside the test process; the binary is a second process
//! connecting to the same endpoint.

mod common;

use std::process::{Command, Output, Stdio};
use std::sync::Arc;

use common::TestStore;
use serde_json::{json, Value};
use warp_shm::{spawn_worker, ForkingCodec, ObjectId, PutOptions, ShmError, Tensor, TransportHook};

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_warp-shmd"))
}

fn run(store: &TestStore, args: &[&str]) -> Output {
    let output = bin()
        .arg("--socket")
        .arg(store.socket_path())
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "warp-shmd {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

fn sample() -> Tensor {
    Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6]).unwrap()
}

#[test]
fn test_get_from_another_process() {
    let store = TestStore::start();
    let client = store.connect();
    let id = ObjectId::new("test111").unwrap();
    client
        .put_tensor(&id, &sample(), PutOptions::default())
        .unwrap();

    let printed = stdout_json(&run(&store, &["get", "test111"]));
    assert_eq!(printed["dtype"], "int64");
    assert_eq!(printed["shape"], json!([2, 3]));
    assert_eq!(printed["strides"], json!([3, 1]));
    assert_eq!(printed["values"], json!([[1, 2, 3], [5, 4, 6]]));
}

#[test]
fn test_put_from_another_process() {
    let store = TestStore::start();
    run(
        &store,
        &[
            "put", "test111", "--dtype", "int64", "--shape", "2,3", "--values", "1,2,3,5,4,6",
        ],
    );

    let client = store.connect();
    let fetched = client.get_tensor(&ObjectId::new("test111").unwrap()).unwrap();
    assert_eq!(fetched, sample());

    let listed = String::from_utf8(run(&store, &["list"]).stdout).unwrap();
    assert_eq!(listed.trim(), "test111");
}

#[test]
fn test_writes_from_another_process_are_visible() {
    let store = TestStore::start();
    let client = store.connect();
    let id = ObjectId::new("shared").unwrap();
    let view = client
        .put_tensor(&id, &sample(), PutOptions::default())
        .unwrap();

    run(&store, &["fill", "shared", "-3"]);
    assert_eq!(view.to_vec::<i64>().unwrap(), vec![-3; 6]);
}

#[test]
fn test_unknown_identifier_in_another_process() {
    let store = TestStore::start();
    let output = bin()
        .arg("--socket")
        .arg(store.socket_path())
        .args(["get", "nonexistent"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("object not found"));
}

#[test]
fn test_worker_receives_tensors_transparently() {
    let store = TestStore::start();
    let client = Arc::new(store.connect());
    let codec = ForkingCodec::new();
    codec.register(TransportHook::new(Arc::clone(&client)));

    let a = sample();
    let b = Tensor::from_vec(&[2], vec![0.5f32, 1.5]).unwrap();
    let args = vec![("a".to_string(), &a), ("b".to_string(), &b)];

    let mut command = bin();
    command.arg("worker").stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = spawn_worker(&codec, command, &args).unwrap().join().unwrap();

    let printed = stdout_json(&output);
    assert_eq!(printed[0]["id"], "a");
    assert_eq!(printed[0]["values"], json!([[1, 2, 3], [5, 4, 6]]));
    assert_eq!(printed[1]["dtype"], "float32");
    assert_eq!(printed[1]["values"], json!([0.5, 1.5]));
    // the tensors travelled through the store, not the pipe
    assert_eq!(client.stats().unwrap().objects, 2);
}

#[test]
fn test_worker_writes_alias_parent_view() {
    let store = TestStore::start();
    let client = Arc::new(store.connect());
    let codec = ForkingCodec::new();
    codec.register(TransportHook::new(Arc::clone(&client)));

    let view = client
        .put_tensor(&ObjectId::new("batch").unwrap(), &sample(), PutOptions::default())
        .unwrap();
    let args = vec![("batch".to_string(), &view)];

    let mut command = bin();
    command
        .args(["worker", "--fill", "8"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    spawn_worker(&codec, command, &args).unwrap().join().unwrap();

    assert_eq!(view.to_vec::<i64>().unwrap(), vec![8; 6]);
    assert_eq!(client.list().unwrap().len(), 1);
}

#[test]
fn test_worker_failure_propagates() {
    let store = TestStore::start();
    let client = Arc::new(store.connect());
    let codec = ForkingCodec::new();
    codec.register(TransportHook::new(client));

    let dir = tempfile::tempdir().unwrap();
    let mut command = bin();
    command
        .arg("--socket")
        .arg(dir.path().join("missing.sock"))
        .arg("worker")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let args = vec![("a".to_string(), sample())];
    // the child may exit before reading its arguments
    let result = spawn_worker(&codec, command, &args).and_then(|worker| worker.join());
    assert!(matches!(result, Err(ShmError::Worker(_))), "got {result:?}");
}
