//! End-to-end executor scenarios: real keys, real signatures, real
//! sandbox directories, real child processes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use actionpack_core::crypto::KeyStore;
use actionpack_core::executor::{now_epoch_ms, ExecutorOptions};
use actionpack_core::keystore::PubkeyMap;
use actionpack_core::policy::{KeyPolicy, PolicyMap};
use actionpack_core::replay::ReplayCache;
use actionpack_core::sandbox::SandboxRoot;
use actionpack_core::{
    encode_envelope, encode_payload, Envelope, ExecStep, Pack, PackExecutor, PackId, Step,
    WriteFileStep,
};
use tempfile::TempDir;

struct Rig {
    dir: TempDir,
    keys: KeyStore,
    root: std::path::PathBuf,
}

impl Rig {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("sandbox");
        std::fs::create_dir(&root).unwrap();
        let keys = KeyStore::open(dir.path().join("keys")).unwrap();
        keys.generate("k1").unwrap();
        Self { dir, keys, root }
    }

    fn executor(&self, policy: Option<PolicyMap>) -> PackExecutor {
        let mut pubkeys = PubkeyMap::new();
        pubkeys.insert("k1".to_string(), self.keys.export_public("k1").unwrap());
        PackExecutor::new(
            pubkeys,
            policy,
            ReplayCache::load(self.dir.path().join("seen"), now_epoch_ms()),
            SandboxRoot::resolve(&self.root).unwrap(),
            ExecutorOptions {
                home: None,
                sink: Arc::new(actionpack_core::sink::NullSink),
                ..ExecutorOptions::default()
            },
        )
    }

    fn base_pack(&self) -> Pack {
        let now = now_epoch_ms();
        Pack {
            key_id: "k1".to_string(),
            created_ms: now,
            expires_ms: now + 60_000,
            pack_id: PackId::random(),
            ..Pack::default()
        }
    }

    fn envelope(&self, pack: &Pack) -> Vec<u8> {
        let payload = encode_payload(pack).unwrap();
        let signature = self.keys.sign("k1", &payload).unwrap();
        encode_envelope(&Envelope { payload, signature }).unwrap()
    }

    fn root_str(&self) -> String {
        std::fs::canonicalize(&self.root)
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }
}

fn exec(argv: &[&str]) -> Step {
    Step::Exec(ExecStep {
        argv: argv.iter().map(ToString::to_string).collect(),
        cwd: String::new(),
        timeout_ms: 0,
    })
}

fn permissive_policy() -> PolicyMap {
    let mut map = PolicyMap::new();
    map.insert(
        "k1".to_string(),
        KeyPolicy {
            allowed_cmds: HashSet::new(),
            allowed_env: HashSet::new(),
            allow_root_scripts: true,
            allow_exec_writes: true,
        },
    );
    map
}

#[tokio::test]
async fn happy_exec() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["/bin/echo", "hello"]));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    let mut lines = transcript.lines();
    assert_eq!(
        lines.next().unwrap(),
        format!("OK pack_id={} steps=1", pack.pack_id.hex())
    );
    assert!(lines.next().unwrap().starts_with("STEP 0 exec exit=0 dur_ms="));
    assert_eq!(lines.next().unwrap(), "--- STDOUT (6 bytes) ---");
    assert_eq!(lines.next().unwrap(), "hello");
    assert_eq!(lines.next(), None);
}

#[tokio::test]
async fn write_then_exec_of_written_file_is_denied() {
    let rig = Rig::new();
    let executor = rig.executor(Some(permissive_policy()));
    let script_path = format!("{}/run.sh", rig.root_str());

    let mut pack = rig.base_pack();
    pack.steps.push(Step::WriteFile(WriteFileStep {
        path: script_path.clone(),
        data: b"#!/bin/sh\necho hi\n".to_vec(),
        mode: 0o755,
    }));
    pack.steps.push(exec(&[&script_path]));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(
        transcript.contains("STEP 0 write OK bytes=18"),
        "{transcript}"
    );
    assert!(transcript.contains("STEP 1 ERR cmd_not_allowed"), "{transcript}");
    // The file itself landed, executable, inside the sandbox.
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&script_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
}

#[tokio::test]
async fn root_script_from_an_earlier_pack_is_allowed() {
    let rig = Rig::new();
    let executor = rig.executor(Some(permissive_policy()));
    let script_path = format!("{}/tool.sh", rig.root_str());

    let mut first = rig.base_pack();
    first.steps.push(Step::WriteFile(WriteFileStep {
        path: script_path.clone(),
        data: b"#!/bin/sh\necho from-tool\n".to_vec(),
        mode: 0o755,
    }));
    let transcript = executor.handle_request(&rig.envelope(&first)).await;
    assert!(transcript.contains("STEP 0 write OK"), "{transcript}");

    let mut second = rig.base_pack();
    second.steps.push(exec(&[&script_path]));
    let transcript = executor.handle_request(&rig.envelope(&second)).await;
    assert!(transcript.contains("STEP 0 exec exit=0"), "{transcript}");
    assert!(transcript.contains("from-tool"), "{transcript}");
}

#[tokio::test]
async fn path_escape_is_contained() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let outside = rig.dir.path().join("escape.txt");

    let mut pack = rig.base_pack();
    pack.steps.push(Step::WriteFile(WriteFileStep {
        path: format!("{}/../escape.txt", rig.root_str()),
        data: b"evil".to_vec(),
        mode: 0o644,
    }));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(
        transcript.contains("STEP 0 write ERR bad parent dir")
            || transcript.contains("STEP 0 write ERR path outside root"),
        "{transcript}"
    );
    assert!(!outside.exists());
}

#[tokio::test]
async fn expired_pack_is_rejected() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.expires_ms = now_epoch_ms() - 60_000;
    pack.steps.push(exec(&["/bin/echo", "late"]));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert_eq!(transcript, "ERR pack expired\n");
}

#[tokio::test]
async fn created_in_future_is_rejected() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.created_ms = now_epoch_ms() + 120_000;
    pack.steps.push(exec(&["/bin/echo", "early"]));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert_eq!(transcript, "ERR created_ms in future\n");
}

#[tokio::test]
async fn replay_is_rejected_and_steps_do_not_rerun() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let marker = format!("{}/marker", rig.root_str());

    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["/bin/sh", "-c", &format!("echo ran >> {marker}")]));
    // /bin/sh is in the built-in allowlist, so the side effect lands once.
    let bytes = rig.envelope(&pack);

    let first = executor.handle_request(&bytes).await;
    assert!(first.starts_with("OK "), "{first}");
    let second = executor.handle_request(&bytes).await;
    assert_eq!(second, "ERR replay\n");
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "ran\n");
}

#[tokio::test]
async fn tampered_payload_and_signature_are_rejected() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["/bin/echo", "x"]));
    let bytes = rig.envelope(&pack);

    // Flip one bit in the signature (the last byte on the wire).
    let mut bad_sig = bytes.clone();
    let last = bad_sig.len() - 1;
    bad_sig[last] ^= 0x01;
    let transcript = executor.handle_request(&bad_sig).await;
    assert!(transcript.starts_with("ERR signature invalid:"), "{transcript}");

    // Flip one bit inside the payload (expires_ms field).
    let mut bad_payload = bytes;
    bad_payload[8 + 16] ^= 0x01;
    let transcript = executor.handle_request(&bad_payload).await;
    assert!(transcript.starts_with("ERR signature invalid:"), "{transcript}");
}

#[tokio::test]
async fn unknown_key_and_missing_policy() {
    let rig = Rig::new();
    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["/bin/echo", "x"]));

    // Executor without k1 in its table.
    let executor = PackExecutor::new(
        PubkeyMap::new(),
        None,
        ReplayCache::load(rig.dir.path().join("seen2"), 0),
        SandboxRoot::resolve(&rig.root).unwrap(),
        ExecutorOptions::default(),
    );
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert_eq!(transcript, "ERR unknown key_id: k1\n");

    // Policy configured but with no line for k1.
    let executor = rig.executor(Some(PolicyMap::new()));
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert_eq!(transcript, "ERR policy missing for key_id: k1\n");
}

#[tokio::test]
async fn env_hygiene_end_to_end() {
    let rig = Rig::new();
    let mut policy = permissive_policy();
    {
        let p = policy.get_mut("k1").unwrap();
        p.allowed_cmds.insert("/bin/sh".to_string());
        p.allowed_env.insert("KEEP".to_string());
    }
    let executor = rig.executor(Some(policy));

    let mut pack = rig.base_pack();
    pack.env.insert("KEEP".to_string(), "yes".to_string());
    pack.env.insert("DROPPED".to_string(), "no".to_string());
    pack.env.insert("LD_PRELOAD".to_string(), "evil.so".to_string());
    pack.steps.push(Step::Exec(ExecStep {
        argv: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf '%s|%s|%s' \"$KEEP\" \"$DROPPED\" \"$LD_PRELOAD\"".to_string(),
        ],
        cwd: String::new(),
        timeout_ms: 0,
    }));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("yes||"), "{transcript}");
}

#[tokio::test]
async fn timeout_is_enforced_and_reported() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.steps.push(Step::Exec(ExecStep {
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        cwd: String::new(),
        timeout_ms: 300,
    }));

    let start = Instant::now();
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(start.elapsed().as_millis() < 300 + 2_000, "{transcript}");
    assert!(transcript.contains(" timed_out=1"), "{transcript}");
}

#[tokio::test]
async fn cwd_outside_root_is_rejected() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let mut pack = rig.base_pack();
    pack.steps.push(Step::Exec(ExecStep {
        argv: vec!["/bin/pwd".to_string()],
        cwd: "/".to_string(),
        timeout_ms: 0,
    }));
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("STEP 0 ERR cwd_outside_root"), "{transcript}");

    let mut pack = rig.base_pack();
    pack.steps.push(Step::Exec(ExecStep {
        argv: vec!["/bin/pwd".to_string()],
        cwd: format!("{}/nonexistent", rig.root_str()),
        timeout_ms: 0,
    }));
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("STEP 0 ERR bad_cwd"), "{transcript}");
}

#[tokio::test]
async fn bare_names_map_and_unmapped_names_are_rejected() {
    let rig = Rig::new();
    let executor = rig.executor(None);

    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["echo", "mapped"]));
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("exec exit=0"), "{transcript}");
    assert!(transcript.contains("mapped"), "{transcript}");

    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["definitely-not-a-tool"]));
    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("STEP 0 ERR cmd_not_allowed"), "{transcript}");
}

#[tokio::test]
async fn first_failing_step_stops_the_pack() {
    let rig = Rig::new();
    let executor = rig.executor(None);
    let marker = format!("{}/after", rig.root_str());

    let mut pack = rig.base_pack();
    pack.steps.push(exec(&["/bin/sh", "-c", "exit 7"]));
    pack.steps
        .push(exec(&["/bin/sh", "-c", &format!("echo no > {marker}")]));

    let transcript = executor.handle_request(&rig.envelope(&pack)).await;
    assert!(transcript.contains("STEP 0 exec exit=7"), "{transcript}");
    assert!(!transcript.contains("STEP 1"), "{transcript}");
    assert!(!std::path::Path::new(&marker).exists());
}
