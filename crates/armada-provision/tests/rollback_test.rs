use armada_provision::{IngressRule, VolumeAttachment};
use armada_cloud::ServerStatus;
mod common;
use common::TestModel;

// A placement that disagrees with the attached volumes fails before any
// remote resource is created.
#[tokio::test]
async fn test_zone_conflict_provisions_nothing() {
    let model = TestModel::new();

    let request = model
        .request("web-0")
        .with_placement("zone=az1")
        .with_volume(VolumeAttachment::new("vol-1", "az2"));
    let err = model.session.start_instance(request).await.unwrap_err();

    assert!(err.error.to_string().contains("az2"));
    assert!(err.rollback.is_empty());
    let counts = model.backend.counts();
    assert_eq!(counts.create_server, 0);
    assert_eq!(counts.create_rule_group, 0);
    assert_eq!(counts.allocate_address, 0);
}

// A server that lands in the error state after its groups were created
// must unwind the instance group; the shared model group survives for the
// next launch.
#[tokio::test]
async fn test_failed_build_leaves_no_orphaned_group() {
    let model = TestModel::new();
    model.backend.script_next_server(
        vec![ServerStatus::Building, ServerStatus::Error],
        Some("Exceeded maximum number of retries"),
    );

    let request = model
        .request("web-0")
        .with_ingress_rule(IngressRule::new("tcp", 22, 22));
    let err = model.session.start_instance(request).await.unwrap_err();

    assert!(err.error.to_string().contains("cannot run instance"));
    assert!(err.rollback.is_clean());
    assert!(model.model_servers().await.is_empty());
    assert!(model.backend.held_addresses().is_empty());
    let groups = model.backend.rule_group_names();
    assert_eq!(groups.len(), 1, "only the shared model group may remain");
    assert!(!groups[0].ends_with("web-0"));

    // The surviving shared group is picked up by the next launch.
    let started = model
        .session
        .start_instance(model.request("web-1"))
        .await
        .unwrap();
    assert_eq!(model.backend.rule_group_names().len(), 2);
    assert!(model.backend.server(started.instance.id()).is_some());
}

// An address allocated for an instance whose association never succeeds is
// handed back, together with the instance and its group.
#[tokio::test(start_paused = true)]
async fn test_failed_association_unwinds_address_server_and_group() {
    let model = TestModel::new();
    model.backend.set_associate_failures(u32::MAX);

    let err = model
        .session
        .start_instance(model.request("web-0"))
        .await
        .unwrap_err();

    assert!(err.error.to_string().contains("cannot assign public address"));
    assert!(err.rollback.is_clean());
    assert_eq!(err.rollback.completed.len(), 3);
    assert!(model.model_servers().await.is_empty());
    assert!(model.backend.held_addresses().is_empty());
    assert!(model.backend.associated_addresses().is_empty());
    assert!(model
        .backend
        .rule_group_names()
        .iter()
        .all(|n| !n.ends_with("web-0")));
}

// Compensations that themselves fail are reported, not silently dropped,
// and never mask the original failure.
#[tokio::test(start_paused = true)]
async fn test_compensation_failures_are_reported_not_masked() {
    let model = TestModel::new();
    model.backend.set_associate_failures(u32::MAX);
    model.backend.fail_next(
        "release_address",
        armada_cloud::BackendError::Api("address stuck".into()),
    );

    let err = model
        .session
        .start_instance(model.request("web-0"))
        .await
        .unwrap_err();

    // The caller still sees the association failure.
    assert!(err.error.to_string().contains("cannot assign public address"));
    assert!(!err.rollback.is_clean());
    assert_eq!(err.rollback.failed.len(), 1);
    let (compensation, cause) = &err.rollback.failed[0];
    assert!(compensation.to_string().starts_with("release address"));
    assert!(cause.to_string().contains("address stuck"));
}
