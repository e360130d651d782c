//! Node failure and recovery test for a minicoord cluster

use minicoord::common::{Config, ConsensusConfig, NodeState};
use minicoord::{Error, LocalCluster};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_detectors_flag_crashed_leader() {
    let cluster_config = Config::default();
    let mut cluster = LocalCluster::start_with_config(3, &cluster_config).unwrap();

    let old = cluster.wait_for_leader(WAIT).await.expect("no leader");
    let old_id = old.id().to_string();
    let old_term = old.term();
    assert!(old.propose(b"x".to_vec()).await.unwrap());
    drop(old);

    // let every detector collect a few heartbeat intervals
    tokio::time::sleep(Duration::from_millis(500)).await;
    let survivors: Vec<String> = cluster
        .ids()
        .iter()
        .filter(|id| **id != old_id)
        .cloned()
        .collect();
    for id in &survivors {
        let detector = cluster.detector(id).unwrap();
        assert_eq!(detector.peer_state(&old_id), NodeState::Alive);
    }

    cluster.crash(&old_id);
    let new = cluster
        .wait_for_leader_after(old_term, WAIT)
        .await
        .expect("no replacement leader");
    assert!(survivors.iter().any(|id| id == new.id()));

    // phi keeps climbing while the silence lasts
    tokio::time::sleep(Duration::from_secs(2)).await;
    for id in &survivors {
        let detector = cluster.detector(id).unwrap();
        assert!(detector.is_suspected(&old_id), "{} still trusts {}", id, old_id);
        assert!(detector.check_all().contains(&old_id));
    }
    assert!(new.propose(b"y".to_vec()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_majority_failure_blocks_progress() {
    let mut cluster = LocalCluster::start(3, ConsensusConfig::default()).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.expect("no leader");
    let leader_id = leader.id().to_string();
    drop(leader);

    let ids = cluster.ids().to_vec();
    let follower = ids.iter().find(|id| **id != leader_id).unwrap().clone();
    for id in &ids {
        if *id != follower {
            cluster.crash(id);
        }
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    let lone = cluster.node(&follower).unwrap();
    assert!(!lone.is_leader());
    assert!(matches!(
        lone.propose(b"nope".to_vec()).await,
        Err(Error::NotLeader(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_follower_restart_catches_up() {
    let mut cluster = LocalCluster::start(3, ConsensusConfig::default()).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.expect("no leader");
    let follower = cluster
        .ids()
        .iter()
        .find(|id| id.as_str() != leader.id())
        .unwrap()
        .clone();

    cluster.crash(&follower);
    for i in 0..10u8 {
        assert!(leader.propose(vec![i]).await.unwrap());
    }

    cluster.restart(&follower).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let restarted = cluster.node(&follower).unwrap();
    assert_eq!(restarted.commit_index(), leader.commit_index());
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    assert_eq!(cluster.applied(&follower), expected);
}
