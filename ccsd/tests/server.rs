//! End-to-end protocol tests for ccsd
//!
//! Each test runs a real server on an ephemeral port with the simulated
//! controller, plus in-process peer servers where delegation is involved.

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ccsclient::CcsClient;
use ccsd_lib::config::ServerConfig;
use ccsd_lib::hardware::{HardwareHandle, SimCcd};
use ccsd_lib::listener::Server;
use ccslib::{codes, read_frame, tags, write_frame, Ack, Command, Done, ServerMessage};
use serde_json::json;
use tempfile::TempDir;

/// How an in-process peer answers each delegated command
#[derive(Clone, Copy)]
enum PeerBehavior {
    /// Immediate success Done
    Succeed,
    /// One Ack, then a success Done
    AckThenSucceed,
    /// Hold the connection open without ever answering
    Silent,
    /// Immediate failure Done
    Fail,
}

fn spawn_peer(behavior: PeerBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let Ok(cmd) = read_frame::<_, Command>(&mut stream) else {
                    return;
                };
                match behavior {
                    PeerBehavior::Succeed => {
                        let _ = write_frame(&mut stream, &ServerMessage::Done(Done::success(cmd.id)));
                    }
                    PeerBehavior::AckThenSucceed => {
                        let _ =
                            write_frame(&mut stream, &ServerMessage::Ack(Ack::new(cmd.id, 2_000)));
                        let _ = write_frame(&mut stream, &ServerMessage::Done(Done::success(cmd.id)));
                    }
                    PeerBehavior::Silent => {
                        thread::sleep(Duration::from_secs(10));
                    }
                    PeerBehavior::Fail => {
                        let _ = write_frame(
                            &mut stream,
                            &ServerMessage::Done(Done::failure(cmd.id, 1, "peer rejected")),
                        );
                    }
                }
            });
        }
    });

    addr
}

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    schedule_state_path: PathBuf,
    _dir: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
    }
}

const NO_RECIPES: &str = "[]";

fn start_server(
    telescope: SocketAddr,
    pipeline: SocketAddr,
    recipes_json: &str,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let recipe_path = dir.path().join("recipes.json");
    fs::write(&recipe_path, recipes_json).unwrap();
    let schedule_state_path = dir.path().join("schedule.state");

    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        telescope_addr: telescope.to_string(),
        pipeline_addr: pipeline.to_string(),
        default_ack_ms: 2_000,
        min_ack_ms: 100,
        readout_overhead_ms: 50,
        recipe_path,
        schedule_state_path: schedule_state_path.clone(),
        frame_dir: dir.path().join("frames"),
    };
    config.validate().unwrap();

    let (driver, abort) = SimCcd::with_timing(1, 30);
    let hardware = HardwareHandle::new(Box::new(driver), abort);
    let server = Arc::new(Server::new(config, hardware).unwrap());
    let addr = server.local_addr().unwrap();

    {
        let server = server.clone();
        thread::spawn(move || {
            let _ = server.run();
        });
    }

    TestServer {
        server,
        addr,
        schedule_state_path,
        _dir: dir,
    }
}

fn dummy_peer() -> SocketAddr {
    spawn_peer(PeerBehavior::Succeed)
}

#[test]
fn ping_yields_exactly_one_done() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let done = client.ping().unwrap();
    assert!(done.successful);
    assert_eq!(done.error_code, codes::OK);
    assert!(done.fields.contains_key("timestamp_ms"));
}

#[test]
fn unknown_command_gets_fallback_done() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let cmd = Command::new(client.next_id(), "NO_SUCH_COMMAND");
    let exchange = client.execute(cmd).unwrap();
    assert!(!exchange.done.successful);
    assert_eq!(exchange.done.error_code, codes::UNKNOWN_COMMAND);
}

#[test]
fn status_reports_idle_phase() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let done = client.status().unwrap();
    assert!(done.successful);
    assert_eq!(done.fields["phase"], json!("idle"));
}

#[test]
fn expose_produces_a_spooled_frame() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let exchange = client.expose(100).unwrap();
    assert!(exchange.done.successful);
    let path = exchange.done.fields["frame_path"].as_str().unwrap();
    assert!(fs::metadata(path).unwrap().len() > 0);
    // The initial ack covers the known exposure duration
    assert!(exchange.acks[0].time_to_complete_ms >= 100);
}

#[test]
fn abort_mid_exposure_yields_aborted_done_promptly() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let addr = server.addr.to_string();

    let exposing = {
        let addr = addr.clone();
        thread::spawn(move || {
            let client = CcsClient::new(addr);
            let start = Instant::now();
            let exchange = client.expose(10_000).unwrap();
            (exchange.done, start.elapsed())
        })
    };

    // Let the exposure get under way, then abort every active session
    thread::sleep(Duration::from_millis(300));
    let interrupter = CcsClient::new(addr);
    let done = interrupter.abort(None).unwrap();
    assert!(done.successful);
    assert_eq!(done.fields["aborted"], json!(1));

    let (done, elapsed) = exposing.join().unwrap();
    assert!(!done.successful);
    assert_eq!(done.error_code, codes::ABORTED);
    // Far less than the 10 s exposure: one phase tick plus margins
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
}

#[test]
fn targeted_abort_spares_the_other_sessions_exposure() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let addr = server.addr.to_string();

    let first = {
        let addr = addr.clone();
        thread::spawn(move || {
            let client = CcsClient::new(addr);
            let cmd = Command::new(11, tags::EXPOSE).with_field("exposure_ms", json!(1_500));
            client.execute(cmd).unwrap().done
        })
    };
    thread::sleep(Duration::from_millis(300));

    let second = {
        let addr = addr.clone();
        thread::spawn(move || {
            let client = CcsClient::new(addr);
            let cmd = Command::new(22, tags::EXPOSE).with_field("exposure_ms", json!(8_000));
            client.execute(cmd).unwrap().done
        })
    };
    thread::sleep(Duration::from_millis(300));

    // The second exposure is queued behind the first; abort only it
    let interrupter = CcsClient::new(addr);
    let done = interrupter.abort(Some(22)).unwrap();
    assert!(done.successful);
    assert_eq!(done.fields["aborted"], json!(1));

    // The owner of the in-flight exposure is untouched and completes
    let first_done = first.join().unwrap();
    assert!(first_done.successful, "done: {:?}", first_done);

    // The flagged session winds down at the checkpoint after its lock wait
    let second_done = second.join().unwrap();
    assert!(!second_done.successful);
    assert_eq!(second_done.error_code, codes::ABORTED);
}

#[test]
fn stop_flags_session_without_hardware_interrupt() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let addr = server.addr.to_string();

    let exposing = {
        let addr = addr.clone();
        thread::spawn(move || {
            let client = CcsClient::new(addr);
            client.expose(700).unwrap().done
        })
    };

    thread::sleep(Duration::from_millis(200));
    let interrupter = CcsClient::new(addr);
    let done = interrupter.stop(None).unwrap();
    assert!(done.successful);
    assert_eq!(done.fields["stopped"], json!(1));

    // The exposure itself is not interrupted; the implementation winds
    // down at its next checkpoint, after the blocking call returns.
    let done = exposing.join().unwrap();
    assert!(!done.successful);
    assert_eq!(done.error_code, codes::ABORTED);
}

#[test]
fn delegation_abandoned_within_a_tick_when_peer_is_silent() {
    let telescope = spawn_peer(PeerBehavior::Silent);
    let server = start_server(telescope, dummy_peer(), NO_RECIPES);
    let addr = server.addr.to_string();

    let exposing = {
        let addr = addr.clone();
        thread::spawn(move || {
            let client = CcsClient::new(addr);
            let cmd = Command::new(client.next_id(), tags::EXPOSE)
                .with_field("exposure_ms", json!(100))
                .with_field("query_telescope", json!(true));
            client.execute(cmd).unwrap().done
        })
    };

    thread::sleep(Duration::from_millis(300));
    let interrupter = CcsClient::new(addr);
    interrupter.abort(None).unwrap();

    let abort_time = Instant::now();
    let done = exposing.join().unwrap();
    assert!(!done.successful);
    assert_eq!(done.error_code, codes::ABORTED);
    // The silent peer never forces a long wait: the abort is observed
    // within one poll tick
    assert!(abort_time.elapsed() < Duration::from_secs(2));
}

#[test]
fn peer_acks_are_relayed_to_the_original_caller() {
    let telescope = spawn_peer(PeerBehavior::AckThenSucceed);
    let server = start_server(telescope, dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let cmd = Command::new(client.next_id(), tags::EXPOSE)
        .with_field("exposure_ms", json!(50))
        .with_field("query_telescope", json!(true));
    let exchange = client.execute(cmd).unwrap();
    assert!(exchange.done.successful);
    // Initial ack plus the relayed telescope ack; the relay adds a margin
    // to the peer's advertised deadline
    assert!(exchange.acks.len() >= 2, "acks: {}", exchange.acks.len());
    assert!(exchange.acks[1].time_to_complete_ms > 2_000);
}

#[test]
fn peer_failure_is_distinguished_from_abort() {
    let telescope = spawn_peer(PeerBehavior::Fail);
    let server = start_server(telescope, dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let cmd = Command::new(client.next_id(), tags::EXPOSE)
        .with_field("exposure_ms", json!(50))
        .with_field("query_telescope", json!(true));
    let done = client.execute(cmd).unwrap().done;
    assert!(!done.successful);
    assert_eq!(done.error_code, codes::PEER_FAILED);
}

const BIAS_RECIPES: &str = r#"[
    {"kind": "bias", "bin": 1, "frequency_ms": 3600000, "count": 2}
]"#;

#[test]
fn calibrate_runs_due_recipes_and_persists_progress() {
    let pipeline = spawn_peer(PeerBehavior::AckThenSucceed);
    let server = start_server(dummy_peer(), pipeline, BIAS_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let exchange = client.calibrate(600_000).unwrap();
    assert!(exchange.done.successful, "done: {:?}", exchange.done);
    assert_eq!(exchange.done.fields["recipes_run"], json!(1));
    assert_eq!(exchange.done.fields["frames_taken"], json!(2));
    // Initial ack, two per-frame acks, two reduction acks, the master-bias
    // ack, plus relayed peer acks
    assert!(exchange.acks.len() >= 6, "acks: {}", exchange.acks.len());

    let state = fs::read_to_string(&server.schedule_state_path).unwrap();
    assert!(state.contains("BIAS/bin1/alt0/freq3600000/n2/exp0="));

    // Re-running immediately with an unchanged recipe list admits nothing
    let exchange = client.calibrate(600_000).unwrap();
    assert!(exchange.done.successful);
    assert_eq!(exchange.done.fields["recipes_run"], json!(0));
    assert_eq!(exchange.done.fields["frames_taken"], json!(0));
}

#[test]
fn calibrate_surfaces_pipeline_failure_after_persisting_nothing() {
    let pipeline = spawn_peer(PeerBehavior::Fail);
    let server = start_server(dummy_peer(), pipeline, BIAS_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let exchange = client.calibrate(600_000).unwrap();
    assert!(!exchange.done.successful);
    assert_eq!(exchange.done.error_code, codes::PEER_FAILED);

    // The failed recipe's last_run was never recorded
    let state = fs::read_to_string(&server.schedule_state_path).unwrap_or_default();
    assert!(!state.contains("BIAS/"));
}

#[test]
fn setup_applies_binning() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let done = client.setup(2, true).unwrap();
    assert!(done.successful);

    // A subsequent readout reflects the new binning
    let exchange = client.expose(50).unwrap();
    assert_eq!(exchange.done.fields["width"], json!(256));
}

#[test]
fn setup_rejects_invalid_binning() {
    let server = start_server(dummy_peer(), dummy_peer(), NO_RECIPES);
    let client = CcsClient::new(server.addr.to_string());

    let done = client.setup(0, false).unwrap();
    assert!(!done.successful);
    assert_eq!(done.error_code, codes::BAD_REQUEST);
}
