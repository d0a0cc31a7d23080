mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use futures::future::join_all;
use satnet_overlay::{CheckInRequest, FindStorageNodesRequest, OverlayConfig, OverlayError};
use satnet_overlay_db::{
    AuditOutcome, DisqualificationReason, InfoResponse, NodeCapacity, NodeId, NodeOperator,
    NodeType, NodeVersion, ReputationStatus,
};
use satnet_overlay_db_memory::MemoryNodeStore;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use common::{FREE_DISK, full_check_in, overlay_config, seed, service};

#[tokio::test]
#[traced_test]
async fn test_repeated_check_ins_are_idempotent() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let cancel = CancellationToken::new();
    let id = NodeId::random();
    let now = Utc::now();

    for _ in 0..5 {
        service
            .check_in(full_check_in(id, "10.1.2.3:28967".to_string()), now, &cancel)
            .await
            .unwrap();
    }

    let node = service.get(id, &cancel).await.unwrap();
    assert_eq!(node.placement.address, "10.1.2.3:28967");
    assert_eq!(node.placement.last_net, "10.1.2.0");
    assert_eq!(node.version.version, "v1.2.3");
    assert_eq!(node.capacity.free_disk, FREE_DISK);
    assert_eq!(node.status(), ReputationStatus::New);
    assert_eq!(node.contact.last_contact_success, Some(now));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_partial_check_ins_lose_nothing() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let id = NodeId::random();
    let address = "10.9.9.9:28967".to_string();

    let mut tasks = Vec::new();
    for i in 0..150_i64 {
        let service = service.clone();
        let mut request = CheckInRequest::new(id, address.clone(), true);
        match i % 3 {
            0 => request.capacity = Some(NodeCapacity { free_disk: 7 }),
            1 => {
                request.operator = Some(NodeOperator {
                    wallet: "0xfeed".to_string(),
                    email: "ops@example.test".to_string(),
                });
            }
            _ => request.version = Some(NodeVersion::new("v2.0.0")),
        }
        tasks.push(tokio::spawn(async move {
            service
                .check_in(request, Utc::now(), &CancellationToken::new())
                .await
        }));
    }

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let node = service.get(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(node.capacity.free_disk, 7);
    assert_eq!(node.operator.wallet, "0xfeed");
    assert_eq!(node.version.version, "v2.0.0");
    assert_eq!(node.placement.last_net, "10.9.9.0");

    // A later report replaces each group it carries.
    let later = CheckInRequest {
        capacity: Some(NodeCapacity { free_disk: 11 }),
        version: Some(NodeVersion::new("v2.1.0")),
        ..CheckInRequest::new(id, "10.9.8.7:28967", true)
    };
    service
        .check_in(later, Utc::now(), &CancellationToken::new())
        .await
        .unwrap();

    let node = service.get(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(node.capacity.free_disk, 11);
    assert_eq!(node.version.version, "v2.1.0");
    assert_eq!(node.operator.wallet, "0xfeed");
    assert_eq!(node.placement.address, "10.9.8.7:28967");
    assert_eq!(node.placement.last_net, "10.9.8.0");
}

#[tokio::test]
async fn test_check_in_validation() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let cancel = CancellationToken::new();
    let id = NodeId::random();

    let err = service
        .check_in(CheckInRequest::new(id, "", true), Utc::now(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = service
        .check_in(
            CheckInRequest::new(NodeId::default(), "10.0.0.1:1", true),
            Utc::now(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = service
        .check_in(
            CheckInRequest {
                country_code: Some("Germany".to_string()),
                ..CheckInRequest::new(id, "10.0.0.1:1", true)
            },
            Utc::now(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert_matches!(
        service.get(id, &cancel).await,
        Err(OverlayError::NodeNotFound(_))
    );
}

#[tokio::test]
async fn test_cancelled_check_in() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = service
        .check_in(
            CheckInRequest::new(NodeId::random(), "10.0.0.1:1", true),
            Utc::now(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert_matches!(err, OverlayError::Cancelled);
}

#[tokio::test]
async fn test_update_node_info() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let cancel = CancellationToken::new();
    let id = NodeId::random();

    assert_matches!(
        service
            .update_node_info(id, InfoResponse::default(), &cancel)
            .await,
        Err(OverlayError::NodeNotFound(_))
    );

    service
        .check_in(full_check_in(id, "10.0.0.1:1".to_string()), Utc::now(), &cancel)
        .await
        .unwrap();
    let node = service
        .update_node_info(
            id,
            InfoResponse {
                node_type: NodeType::Storage,
                version: Some(NodeVersion::new("v1.9.0")),
                ..InfoResponse::default()
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(node.version.version, "v1.9.0");
    assert_eq!(node.capacity.free_disk, FREE_DISK);
}

#[tokio::test]
#[traced_test]
async fn test_disqualification_is_permanent() {
    let mut config = overlay_config();
    config.selection_cache.disabled = true;
    let service = service(Arc::new(MemoryNodeStore::new()), config);
    let cancel = CancellationToken::new();
    let population = seed(&service, 3, 0, 1).await;
    let target = *population.vetted.iter().next().unwrap();
    let first = Utc::now();

    let reputation = service
        .disqualify_node(target, first, DisqualificationReason::AuditFailure, &cancel)
        .await
        .unwrap();
    assert_eq!(reputation.status(), ReputationStatus::Disqualified);

    assert_matches!(
        service.vet_node(target, &cancel).await,
        Err(OverlayError::Internal(_))
    );
    assert_matches!(
        service.unsuspend_node(target, &cancel).await,
        Err(OverlayError::Internal(_))
    );
    assert_matches!(
        service
            .suspend_node_unknown_audit(target, Utc::now(), &cancel)
            .await,
        Err(OverlayError::Internal(_))
    );

    let again = service
        .disqualify_node(
            target,
            Utc::now(),
            DisqualificationReason::NodeSoftware,
            &cancel,
        )
        .await
        .unwrap();
    let dq = again.disqualification().unwrap();
    assert_eq!(dq.reason, DisqualificationReason::AuditFailure);
    assert_eq!(dq.at, first);

    // Audits keep counting but never revive the node.
    let after_audit = service
        .record_audit(target, AuditOutcome::Success, &cancel)
        .await
        .unwrap();
    assert_eq!(after_audit.status(), ReputationStatus::Disqualified);

    for _ in 0..10 {
        let selected = service
            .find_storage_nodes_for_upload(
                &FindStorageNodesRequest {
                    best_effort: true,
                    ..FindStorageNodesRequest::with_count(3)
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|node| node.id != target));
    }

    let reliability = service.known_reliable(&[target], &cancel).await.unwrap();
    assert!(reliability.online.is_empty());
    assert!(reliability.offline.is_empty());
}

#[tokio::test]
async fn test_audits_drive_reputation() {
    let mut config: OverlayConfig = overlay_config();
    config.reputation.audits_for_vetting = 3;
    config.reputation.unknown_audits_for_suspension = 2;
    let service = service(Arc::new(MemoryNodeStore::new()), config);
    let cancel = CancellationToken::new();
    let id = NodeId::random();
    service
        .check_in(full_check_in(id, "10.0.0.1:1".to_string()), Utc::now(), &cancel)
        .await
        .unwrap();

    for _ in 0..2 {
        let reputation = service
            .record_audit(id, AuditOutcome::Success, &cancel)
            .await
            .unwrap();
        assert_eq!(reputation.status(), ReputationStatus::New);
    }
    let reputation = service
        .record_audit(id, AuditOutcome::Success, &cancel)
        .await
        .unwrap();
    assert_eq!(reputation.status(), ReputationStatus::Vetted);

    service
        .record_audit(id, AuditOutcome::Unknown, &cancel)
        .await
        .unwrap();
    let reputation = service
        .record_audit(id, AuditOutcome::Unknown, &cancel)
        .await
        .unwrap();
    assert_eq!(reputation.status(), ReputationStatus::Suspended);

    let reputation = service
        .record_audit(id, AuditOutcome::Success, &cancel)
        .await
        .unwrap();
    assert_eq!(reputation.status(), ReputationStatus::Vetted);
    assert_eq!(reputation.audits().total, 6);
}

#[tokio::test]
async fn test_known_reliable_scenario() {
    const TOTAL: usize = 211;
    const ONLINE: usize = 90;
    const UNKNOWN: usize = 10;

    let mut config = overlay_config();
    config.node.online_window = Duration::from_secs(1000 * 60 * 60);
    let service = service(Arc::new(MemoryNodeStore::new()), config);
    let cancel = CancellationToken::new();

    let mut check = Vec::new();
    for i in 0..TOTAL {
        let id = NodeId::random();
        service
            .check_in(
                CheckInRequest {
                    version: Some(NodeVersion::new("v1.0.0")),
                    ..CheckInRequest::new(id, format!("127.0.{i}.0:8080"), true)
                },
                Utc::now(),
                &cancel,
            )
            .await
            .unwrap();
        if i < ONLINE {
            check.push(id);
        }
    }
    check.extend((0..UNKNOWN).map(|_| NodeId::random()));

    let reliability = service.known_reliable(&check, &cancel).await.unwrap();
    assert_eq!(reliability.online.len(), ONLINE);
    assert!(reliability.offline.is_empty());
}

#[tokio::test]
async fn test_known_reliable_splits_offline_nodes() {
    let service = service(Arc::new(MemoryNodeStore::new()), overlay_config());
    let cancel = CancellationToken::new();
    let online = NodeId::random();
    let stale = NodeId::random();

    service
        .check_in(full_check_in(online, "10.0.0.1:1".to_string()), Utc::now(), &cancel)
        .await
        .unwrap();
    service
        .check_in(
            full_check_in(stale, "10.0.1.1:1".to_string()),
            Utc::now() - chrono::TimeDelta::hours(2),
            &cancel,
        )
        .await
        .unwrap();

    let reliability = service
        .known_reliable(&[online, stale], &cancel)
        .await
        .unwrap();
    assert_eq!(reliability.online.len(), 1);
    assert_eq!(reliability.online[0].id, online);
    assert_eq!(reliability.offline.len(), 1);
    assert_eq!(reliability.offline[0].id, stale);

    let networks = service
        .get_nodes_network(&[stale, NodeId::random(), online], &cancel)
        .await
        .unwrap();
    assert_eq!(networks, vec!["10.0.1.0".to_string(), "10.0.0.0".to_string()]);
}
