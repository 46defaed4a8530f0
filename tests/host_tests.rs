#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use flowhost::host::messages::WakeJob;
use flowhost::messaging::{publish, ExchangeType};
use flowhost::records::{WorkflowMachineState, WorkflowTrigger};
use flowhost::store::Record;
use flowhost::sync::instance_lock_name;
use flowhost::{InstanceStatus, WorkflowAgent, WorkflowClient, WorkflowTemplate};
use serde_json::Map;

const WAIT: Duration = Duration::from_secs(5);

fn client(cluster: &Cluster) -> WorkflowClient {
    WorkflowClient::new(cluster.store.clone(), cluster.bus(), &fast_options("client"))
}

async fn state_of(client: &WorkflowClient, id: &str) -> Option<String> {
    client.machine_state(id, "main").await.unwrap()
}

async fn create_unhosted(cluster: &Cluster, id: &str, document: &str) {
    let services = cluster.services();
    let options = Arc::new(fast_options("creator"));
    let template = WorkflowTemplate::from_document(document).unwrap();
    WorkflowAgent::create_instance(&services, &options, id, template, Map::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn two_state_instance_reaches_running() {
    let cluster = Cluster::new();
    let host = cluster.started_host("h1").await;
    let client = client(&cluster);

    let id = host.create_workflow_instance(TWO_STATE, Map::new()).await.unwrap();
    assert!(host.is_hosted(&id));
    assert_eq!(client.instance_status(&id).await.unwrap(), InstanceStatus::Active);

    host.fire_on_hosted_workflow(&id, "main", "go").await.unwrap();
    let (c, i) = (&client, id.as_str());
    assert!(wait_for(WAIT, move || async move { state_of(c, i).await.as_deref() == Some("Running") }).await);
    let worker = &cluster.worker;
    assert!(wait_for(WAIT, move || async move { worker.count(i, "run") == 1 }).await);
    assert_eq!(client.instance_status(&id).await.unwrap(), InstanceStatus::Active);

    host.on_stop().await;
}

#[tokio::test]
async fn concurrent_acquisition_starts_one_agent() {
    let cluster = Cluster::new();
    create_unhosted(&cluster, "contended", TWO_STATE).await;
    let hosts: Vec<_> = (0..4).map(|n| cluster.host(&format!("h{n}"))).collect();

    let attempts = futures::future::join_all(hosts.iter().map(|h| h.try_acquire_workflow("contended"))).await;
    let winners = attempts.into_iter().map(Result::unwrap).filter(|won| *won).count();
    assert_eq!(winners, 1);
    assert_eq!(hosts.iter().filter(|h| h.is_hosted("contended")).count(), 1);
    assert!(cluster.locks.is_held(&instance_lock_name("contended")));

    for host in &hosts {
        host.on_stop().await;
    }
}

#[tokio::test]
async fn unknown_instance_is_not_acquired() {
    let cluster = Cluster::new();
    let host = cluster.host("h1");
    assert!(host.try_acquire_workflow("missing").await.is_err());
    assert!(!cluster.locks.is_held(&instance_lock_name("missing")));
}

#[tokio::test]
async fn nap_parks_lease_and_a_trigger_resumes_the_instance() {
    let cluster = Cluster::new();
    let host = cluster.started_host("h1").await;
    let client = client(&cluster);
    let id = host.create_workflow_instance(TWO_STATE, Map::new()).await.unwrap();

    host.nap_workflow(&id).await.unwrap();
    let (h, c, i) = (&host, &client, id.as_str());
    assert!(
        wait_for(WAIT, move || async move {
            !h.is_hosted(i) && c.instance_status(i).await.unwrap() == InstanceStatus::Sleeping
        })
        .await
    );
    assert_eq!(host.parked_instances(), vec![id.clone()]);
    assert!(cluster.locks.is_held(&instance_lock_name(&id)));

    host.fire_on_hosted_workflow(&id, "main", "go").await.unwrap();
    assert!(wait_for(WAIT, move || async move { state_of(c, i).await.as_deref() == Some("Running") }).await);
    assert!(host.is_hosted(&id));
    assert!(host.parked_instances().is_empty());
    assert_eq!(client.instance_status(&id).await.unwrap(), InstanceStatus::Active);

    host.on_stop().await;
    assert!(!cluster.locks.is_held(&instance_lock_name(&id)));
}

#[tokio::test]
async fn end_completes_and_grooming_purges() {
    let cluster = Cluster::new();
    let host = cluster.started_host("h1").await;
    let client = client(&cluster);
    let id = host.create_workflow_instance(TWO_STATE, Map::new()).await.unwrap();
    host.fire_on_hosted_workflow(&id, "main", "go").await.unwrap();
    let (c, i) = (&client, id.as_str());
    assert!(wait_for(WAIT, move || async move { state_of(c, i).await.is_some() }).await);

    host.end_workflow(&id).await.unwrap();
    let status = client
        .wait_for_status(&id, InstanceStatus::Complete, WAIT)
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Complete);
    let h = &host;
    assert!(wait_for(WAIT, move || async move { !h.is_hosted(i) }).await);
    assert!(!cluster.locks.is_held(&instance_lock_name(&id)));

    let report = host.groom_once().await;
    assert_eq!(report.purged, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(client.instance_status(&id).await.unwrap(), InstanceStatus::NoInstance);
    assert_eq!(cluster.store.count(WorkflowMachineState::KIND).await, 0);
    assert_eq!(cluster.store.count(WorkflowTrigger::KIND).await, 0);

    host.on_stop().await;
}

#[tokio::test]
async fn trigger_reaches_instance_hosted_elsewhere() {
    let cluster = Cluster::new();
    let a = cluster.started_host("a").await;
    let b = cluster.started_host("b").await;
    let client = client(&cluster);
    let id = a.create_workflow_instance(TWO_STATE, Map::new()).await.unwrap();
    // b's startup reconciliation may have won the instance
    let (owner, other) = if a.is_hosted(&id) { (&a, &b) } else { (&b, &a) };
    assert!(owner.is_hosted(&id));

    other.fire_on_hosted_workflow(&id, "main", "go").await.unwrap();
    let (c, i) = (&client, id.as_str());
    assert!(wait_for(WAIT, move || async move { state_of(c, i).await.as_deref() == Some("Running") }).await);
    assert!(owner.is_hosted(&id));
    assert!(!other.is_hosted(&id));

    a.on_stop().await;
    b.on_stop().await;
}

#[tokio::test]
async fn client_requests_are_served_by_exactly_one_host() {
    let cluster = Cluster::new();
    let a = cluster.started_host("a").await;
    let b = cluster.started_host("b").await;
    let client = client(&cluster);

    client
        .create_instance_with_id("c1", TWO_STATE, Map::new())
        .await
        .unwrap();
    let (ra, rb) = (&a, &b);
    assert!(wait_for(WAIT, move || async move { ra.is_hosted("c1") || rb.is_hosted("c1") }).await);
    assert!(!(a.is_hosted("c1") && b.is_hosted("c1")));

    client.fire_trigger("c1", "main", "go").await.unwrap();
    let c = &client;
    assert!(wait_for(WAIT, move || async move { state_of(c, "c1").await.as_deref() == Some("Running") }).await);

    client.end_instance("c1").await.unwrap();
    let status = client
        .wait_for_status("c1", InstanceStatus::Complete, WAIT)
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Complete);

    a.on_stop().await;
    b.on_stop().await;
}

#[tokio::test]
async fn invalid_template_is_rejected_by_the_client() {
    let cluster = Cluster::new();
    let client = client(&cluster);
    assert!(client
        .create_instance_with_id("bad", "{ not json", Map::new())
        .await
        .is_err());
}

#[tokio::test]
async fn reconciliation_adopts_orphaned_instances() {
    let cluster = Cluster::new();
    let ids: Vec<String> = (0..7).map(|n| format!("orphan-{n}")).collect();
    for id in &ids {
        create_unhosted(&cluster, id, TWO_STATE).await;
    }

    let host = cluster.started_host("h1").await;
    let h = &host;
    assert!(wait_for(WAIT, move || async move { h.hosted_instances().len() == 7 }).await);
    let mut hosted = host.hosted_instances();
    hosted.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(hosted, expected);

    host.on_stop().await;
}

#[tokio::test]
async fn stopped_host_releases_instances_to_peers() {
    let cluster = Cluster::new();
    let a = cluster.started_host("a").await;
    let id = a.create_workflow_instance(TWO_STATE, Map::new()).await.unwrap();
    a.on_stop().await;
    assert!(a.hosted_instances().is_empty());
    assert!(!cluster.locks.is_held(&instance_lock_name(&id)));

    let b = cluster.started_host("b").await;
    let (h, i) = (&b, id.as_str());
    assert!(wait_for(WAIT, move || async move { h.is_hosted(i) }).await);
    b.on_stop().await;
}

#[tokio::test]
async fn retries_exhaust_into_the_fail_state() {
    let cluster = Cluster::new();
    cluster.worker.fail("send");
    let host = cluster.started_host("h1").await;
    let client = client(&cluster);
    let id = host.create_workflow_instance(RETRYING, Map::new()).await.unwrap();

    host.fire_on_hosted_workflow(&id, "main", "send").await.unwrap();
    let (c, i) = (&client, id.as_str());
    assert!(wait_for(WAIT, move || async move { state_of(c, i).await.as_deref() == Some("Broken") }).await);
    assert_eq!(cluster.worker.count(&id, "send"), 4);
    assert_eq!(client.instance_status(&id).await.unwrap(), InstanceStatus::Active);

    host.on_stop().await;
}

#[tokio::test]
async fn wake_job_fires_activation_triggers() {
    let cluster = Cluster::new();
    let host = cluster.started_host("h1").await;
    let id = host.create_workflow_instance(WAKEFUL, Map::new()).await.unwrap();
    assert_eq!(cluster.worker.count(&id, "doze"), 0);

    let bus = cluster.bus();
    let direct = bus
        .declare_exchange(&host.options().direct_exchange, ExchangeType::Direct)
        .await
        .unwrap();
    let wake = WakeJob { instance_id: id.clone() };
    let delivered = publish(direct.as_ref(), &wake, host.host_id()).await.unwrap();
    assert_eq!(delivered, vec![flowhost::host::direct_queue_name("h1")]);

    let (w, i) = (&cluster.worker, id.as_str());
    assert!(wait_for(WAIT, move || async move { w.count(i, "doze") >= 1 }).await);
    assert!(host.is_hosted(&id));

    host.on_stop().await;
}

#[tokio::test]
async fn napping_with_an_activation_trigger_schedules_a_wake() {
    let cluster = Cluster::new();
    let host = cluster.started_host("h1").await;
    let id = host.create_workflow_instance(WAKEFUL, Map::new()).await.unwrap();

    // the test scheduler delivers the wake job at once
    host.nap_workflow(&id).await.unwrap();
    let (w, h, i) = (&cluster.worker, &host, id.as_str());
    assert!(wait_for(WAIT, move || async move { w.count(i, "doze") >= 1 && h.is_hosted(i) }).await);

    host.on_stop().await;
}

#[tokio::test]
async fn grooming_wakes_sleeping_instances_with_pending_triggers() {
    let cluster = Cluster::new();
    let client = client(&cluster);
    create_unhosted(&cluster, "sleeper", TWO_STATE).await;

    // put the instance to sleep through a host that then goes away
    let first = cluster.host("first");
    assert!(first.try_acquire_workflow("sleeper").await.unwrap());
    first.nap_workflow("sleeper").await.unwrap();
    let c = &client;
    let status = c
        .wait_for_status("sleeper", InstanceStatus::Sleeping, WAIT)
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Sleeping);
    first.on_stop().await;
    drop(first);

    // stored directly, with no notice to any host
    let triggers: flowhost::store::Repository<WorkflowTrigger> = flowhost::store::Repository::new(cluster.store.clone());
    triggers
        .store(&WorkflowTrigger::fire("sleeper", "main", "go"))
        .await
        .unwrap();

    let groomer = cluster.host("groomer");
    let report = groomer.groom_once().await;
    assert_eq!(report.woken, 1);
    assert!(wait_for(WAIT, move || async move { state_of(c, "sleeper").await.as_deref() == Some("Running") }).await);
    groomer.on_stop().await;
}
