//! Integration tests for the long-polling coordinator.
//!
//! These tests validate that:
//! - Requests are parked once a job type produced enough empty responses in a row.
//! - Parked requests time out, get woken by notifications in park order, or are probed.
//! - Requests without long polling complete at once and never arm a timer.
//! - An in-flight request that races a notification is repeated exactly once.
//! - Exhausted partitions and rejections abort the request with the matching code.
//! - Malformed requests are refused up front with INVALID_ARGUMENT.
//!
//! All tests run on paused time, so timers fire as soon as the runtime is idle.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tonic::Code;

use jobflow_lite::config::{GatewayConfig, LongPollingConfig};
use jobflow_lite::error::{BrokerError, Rejection};
use jobflow_lite::gateway::{
    ActivateJobsRequest, ActivateJobsResponse, ActivationDispatcher, LongPollingCoordinator,
    RequestState,
};
use test_harness::{jobs_on, test_long_polling, Scripted, StubPartitionClient, TestGateway};

fn request(request_timeout_ms: i64) -> ActivateJobsRequest {
    ActivateJobsRequest::new("email", "w1", 5).with_request_timeout(request_timeout_ms)
}

async fn wait_until_parked(response: &ActivateJobsResponse) {
    let mut progress = response.progress_watch();
    progress
        .wait_for(|p| p.state == RequestState::Pending && p.has_timer)
        .await
        .expect("coordinator is running");
}

#[tokio::test(start_paused = true)]
async fn request_completes_with_available_jobs() {
    let stub = StubPartitionClient::new(2);
    stub.script(2, Scripted::Jobs(jobs_on(2, "email", 1, 2)));
    let gateway = TestGateway::start(stub, test_long_polling(3));

    let response = gateway.handle.activate_jobs(request(0)).unwrap();
    let progress = response.progress_watch();
    let jobs = response.collect_jobs().await.unwrap();

    assert_eq!(jobs.len(), 2);
    assert_eq!(progress.borrow().state, RequestState::Completed);
    assert!(!progress.borrow().has_timer);
    assert_eq!(gateway.client.called_partitions(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn empty_streak_parks_requests_without_calling_partitions() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(2));

    let first = gateway.handle.activate_jobs(request(1_000)).unwrap();
    wait_until_parked(&first).await;
    let second = gateway.handle.activate_jobs(request(1_000)).unwrap();
    wait_until_parked(&second).await;
    assert_eq!(gateway.client.call_count(), 2);

    // threshold reached: parked without asking any partition
    let third = gateway.handle.activate_jobs(request(1_000)).unwrap();
    wait_until_parked(&third).await;
    assert_eq!(gateway.client.call_count(), 2);

    let stats = gateway.handle.stats("email").await.unwrap();
    assert_eq!(stats.empty_responses, 2);
    assert_eq!(stats.blocked, 3);
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn parked_request_times_out_empty() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(3));
    let started = Instant::now();

    let response = gateway.handle.activate_jobs(request(500)).unwrap();
    let progress = response.terminated().await;

    assert_eq!(progress.state, RequestState::TimedOut);
    assert!(!progress.has_timer);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(response.collect_jobs().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies_when_request_asks_for_none() {
    let config = LongPollingConfig {
        timeout_ms: 3_000,
        ..test_long_polling(3)
    };
    let gateway = TestGateway::start(StubPartitionClient::new(1), config);
    let started = Instant::now();

    let response = gateway.handle.activate_jobs(request(0)).unwrap();
    assert_eq!(response.terminated().await.state, RequestState::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(3_000));
}

#[tokio::test(start_paused = true)]
async fn notification_unblocks_parked_requests_in_order() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(1));

    let mut parked = Vec::new();
    for _ in 0..3 {
        let response = gateway
            .handle
            .activate_jobs(ActivateJobsRequest::new("invoice", "w1", 1).with_request_timeout(10_000))
            .unwrap();
        wait_until_parked(&response).await;
        parked.push(response);
    }
    assert_eq!(gateway.client.call_count(), 1);

    let jobs = jobs_on(1, "invoice", 1, 3);
    for job in &jobs {
        gateway.client.script(1, Scripted::Jobs(vec![job.clone()]));
    }
    gateway.bus.publish("invoice");

    for (response, job) in parked.into_iter().zip(&jobs) {
        assert_eq!(response.collect_jobs().await.unwrap(), vec![job.clone()]);
    }
    assert_eq!(gateway.client.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn notification_for_other_type_leaves_requests_parked() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(1));

    let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
    wait_until_parked(&response).await;
    gateway.handle.notify_jobs_available("invoice");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(gateway.client.call_count(), 1);
    assert_eq!(response.progress().state, RequestState::Pending);
}

#[tokio::test(start_paused = true)]
async fn request_without_long_polling_completes_immediately() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(1));

    // push the job type over the threshold first
    let parked = gateway.handle.activate_jobs(request(10_000)).unwrap();
    wait_until_parked(&parked).await;

    let started = Instant::now();
    let response = gateway.handle.activate_jobs(request(-1)).unwrap();
    let progress = response.terminated().await;

    assert_eq!(progress.state, RequestState::Completed);
    assert!(!progress.has_timer);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(gateway.client.call_count(), 2);
    assert_eq!(
        gateway.handle.stats("email").await.unwrap().empty_responses,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_gateway_never_parks() {
    let config = LongPollingConfig {
        enabled: false,
        ..test_long_polling(1)
    };
    let gateway = TestGateway::start(StubPartitionClient::new(1), config);

    for _ in 0..3 {
        let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
        let progress = response.terminated().await;
        assert_eq!(progress.state, RequestState::Completed);
        assert!(!progress.has_timer);
    }
    assert_eq!(gateway.client.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn probe_retries_oldest_parked_request() {
    let config = LongPollingConfig {
        probe_timeout_ms: 1_000,
        ..test_long_polling(1)
    };
    let gateway = TestGateway::start(StubPartitionClient::new(1), config);
    let started = Instant::now();

    let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
    wait_until_parked(&response).await;
    gateway
        .client
        .script(1, Scripted::Jobs(jobs_on(1, "email", 1, 1)));

    let jobs = response.collect_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert!(started.elapsed() < Duration::from_millis(10_000));
    assert_eq!(gateway.client.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn probe_without_parked_requests_decays_streak() {
    let config = LongPollingConfig {
        probe_timeout_ms: 1_000,
        ..test_long_polling(1)
    };
    let gateway = TestGateway::start(StubPartitionClient::new(1), config);

    let response = gateway.handle.activate_jobs(request(200)).unwrap();
    assert_eq!(response.terminated().await.state, RequestState::TimedOut);
    assert_eq!(
        gateway.handle.stats("email").await.unwrap().empty_responses,
        1
    );

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let stats = gateway.handle.stats("email").await.unwrap();
    assert_eq!(stats.empty_responses, 0);
    assert_eq!(stats.blocked, 0);
}

#[tokio::test(start_paused = true)]
async fn notification_during_dispatch_repeats_once() {
    let stub = StubPartitionClient::new(1).with_delay(Duration::from_millis(100));
    let gateway = TestGateway::start(stub, test_long_polling(5));

    let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(response.progress().state, RequestState::Active);

    gateway.handle.notify_jobs_available("email");
    wait_until_parked(&response).await;

    // one repeat, then parked with a single empty response counted
    assert_eq!(gateway.client.call_count(), 2);
    let stats = gateway.handle.stats("email").await.unwrap();
    assert_eq!(stats.empty_responses, 1);
    assert_eq!(stats.blocked, 1);
}

#[tokio::test(start_paused = true)]
async fn successful_activation_wakes_parked_requests() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(1));

    let parked = gateway.handle.activate_jobs(request(10_000)).unwrap();
    wait_until_parked(&parked).await;

    let jobs = jobs_on(1, "email", 1, 2);
    gateway.client.script(1, Scripted::Jobs(vec![jobs[0].clone()]));
    gateway.client.script(1, Scripted::Jobs(vec![jobs[1].clone()]));

    let immediate = gateway.handle.activate_jobs(request(-1)).unwrap();
    assert_eq!(immediate.collect_jobs().await.unwrap(), vec![jobs[0].clone()]);
    assert_eq!(parked.collect_jobs().await.unwrap(), vec![jobs[1].clone()]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_partitions_abort_request() {
    let stub = StubPartitionClient::new(1);
    stub.script(
        1,
        Scripted::Error(BrokerError::ResourceExhausted { partition_id: 1 }),
    );
    let gateway = TestGateway::start(stub, test_long_polling(3));

    let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
    let progress = response.progress_watch();
    let status = response.collect_jobs().await.unwrap_err();

    assert_eq!(status.code(), Code::ResourceExhausted);
    assert!(status.message().contains("email"));
    assert_eq!(progress.borrow().state, RequestState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_aborts_request_without_long_polling() {
    let stub = StubPartitionClient::new(1);
    stub.script(
        1,
        Scripted::Error(BrokerError::ResourceExhausted { partition_id: 1 }),
    );
    let gateway = TestGateway::start(stub, test_long_polling(3));

    let response = gateway.handle.activate_jobs(request(-1)).unwrap();
    let status = response.collect_jobs().await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
}

#[tokio::test(start_paused = true)]
async fn rejection_aborts_request() {
    let stub = StubPartitionClient::new(2);
    stub.script(
        1,
        Scripted::Error(BrokerError::Rejected(Rejection::invalid_argument(
            "expected to activate job batch with timeout to be greater than zero, but it was '0'",
        ))),
    );
    let gateway = TestGateway::start(stub, test_long_polling(3));

    let response = gateway
        .handle
        .activate_jobs(request(10_000).with_timeout(0))
        .unwrap();
    let status = response.collect_jobs().await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(gateway.client.called_partitions(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn malformed_request_is_refused_without_touching_streak() {
    let gateway = TestGateway::start(StubPartitionClient::new(2), test_long_polling(3));
    let started = Instant::now();

    let response = gateway
        .handle
        .activate_jobs(ActivateJobsRequest::new("email", "w1", 0).with_request_timeout(1_000))
        .unwrap();
    let progress = response.progress_watch();
    let status = response.collect_jobs().await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("max jobs to activate"));
    assert_eq!(progress.borrow().state, RequestState::Aborted);
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(gateway.client.call_count(), 0);

    let response = gateway
        .handle
        .activate_jobs(ActivateJobsRequest::new("email", "", 5))
        .unwrap();
    let status = response.collect_jobs().await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("worker"));

    let stats = gateway.handle.stats("email").await.unwrap();
    assert_eq!(stats.empty_responses, 0);
    assert_eq!(stats.blocked, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_response_cancels_parked_request() {
    let gateway = TestGateway::start(StubPartitionClient::new(1), test_long_polling(1));

    let response = gateway.handle.activate_jobs(request(10_000)).unwrap();
    wait_until_parked(&response).await;
    let mut progress = response.progress_watch();
    drop(response);

    let stats = gateway.handle.stats("email").await.unwrap();
    assert_eq!(stats.blocked, 0);
    let state = progress.wait_for(|p| p.state.is_terminal()).await.unwrap().state;
    assert_eq!(state, RequestState::Canceled);
}

#[tokio::test]
async fn full_request_queue_is_resource_exhausted() {
    let stub = Arc::new(StubPartitionClient::new(1));
    let config = GatewayConfig {
        request_queue_capacity: 1,
        ..Default::default()
    };
    // coordinator never runs, so the queue stays full
    let (coordinator, _rx) =
        LongPollingCoordinator::new(&config, Arc::new(ActivationDispatcher::new(stub)));
    let handle = coordinator.handle();

    let _first = handle.activate_jobs(request(0)).unwrap();
    let status = handle.activate_jobs(request(0)).unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
}
