//! Two full peers talking to each other over loopback with synthetic devices

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lan_voice_call::audio::SyntheticBackend;
use lan_voice_call::config::AppConfig;
use lan_voice_call::pipeline::VoicePipeline;
use lan_voice_call::sync::SyncState;

fn peer_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network.bind_address = "127.0.0.1".parse().unwrap();
    config.network.listen_port = 0;
    config
}

#[test]
fn test_two_peers_hear_each_other() {
    let alice_audio = Arc::new(SyntheticBackend::new().with_tone(440.0, 12000));
    let bob_audio = Arc::new(SyntheticBackend::new().with_tone(660.0, 6000));

    let mut alice = VoicePipeline::new(peer_config(), alice_audio.clone());
    let mut bob = VoicePipeline::new(peer_config(), bob_audio.clone());

    let alice_addr = alice.start(None).unwrap();
    let bob_addr = bob.start(Some(alice_addr)).unwrap();
    alice.set_peer(Some(bob_addr));
    assert_eq!(alice.peer(), Some(bob_addr));

    thread::sleep(Duration::from_millis(1500));

    let alice_view = alice.telemetry();
    let bob_view = bob.telemetry();
    assert!(alice.check_errors().is_none());
    assert!(bob.check_errors().is_none());

    for (name, view) in [("alice", &alice_view), ("bob", &bob_view)] {
        assert!(view.send.chunks_sent > 20, "{} sent too little", name);
        assert!(view.receive.chunks_reassembled > 20, "{} heard too little", name);
        assert_eq!(view.receive.malformed_packets, 0);
        assert!(view.sync.played > 0, "{} played nothing", name);
        assert_ne!(view.sync.state, SyncState::Stopped);
        assert!(view.to_json().is_ok());
    }

    // Each side played the other's tone, not its own
    let loudest = |backend: &SyntheticBackend| {
        backend
            .written()
            .iter()
            .map(|chunk| chunk.peak())
            .max()
            .unwrap_or(0)
    };
    let alice_heard = loudest(&alice_audio);
    let bob_heard = loudest(&bob_audio);
    assert!(alice_heard > 5000 && alice_heard <= 6000, "alice heard peak {}", alice_heard);
    assert!(bob_heard > 11000 && bob_heard <= 12000, "bob heard peak {}", bob_heard);

    alice.stop();
    bob.stop();
    assert_eq!(alice.synchronizer().current_stats().state, SyncState::Stopped);
}
