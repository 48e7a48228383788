mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use batchwork::clients::batch_api::models::OutputStatus;
use batchwork::pipeline::transform::ChunkLimits;
use batchwork::store::dao::{WorkDao, WorkStatus, mutation};
use batchwork::store::models::WorkConfig;
use batchwork::util::error::WorkError;

use common::{
    CronEvent, Harness, HarnessOptions, RecordingRescheduler, RecordingRunner, error_line,
    success_line,
};

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn submission_persists_jobs_and_registers_reinvocation() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default().with_name("nightly"), 3);
    let work = h.create(&runner).await;
    assert_eq!(work.status, WorkStatus::Created);

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(work.undone_job_ids.len(), 2, "3 lines at 2 per chunk");
    assert!(work.done_job_ids.is_empty());
    assert!(work.dataset_fingerprint.is_some());
    assert!(work.submitted_at.is_some());
    assert!(h.rescheduler.is_registered(work.id));

    let jobs = h.jobs_of(&work);
    let first: Vec<_> = h
        .api
        .input_lines(&jobs[0])
        .iter()
        .map(|line| line["custom_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(first, vec!["item-0", "item-1"]);
    assert_eq!(h.api.input_lines(&jobs[1])[0]["url"], "/v1/chat/completions");

    let metadata = h.metadata_of(0);
    assert_eq!(metadata.get("batchwork_work_id"), Some(&work.id.to_string()));
    assert_eq!(metadata.get("chunk").map(String::as_str), Some("0"));
    assert_eq!(h.api.requests()[0].completion_window, "24h");

    assert!(h.dao.list_process_status(work.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn partial_completion_then_convergence() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 4);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let jobs = h.jobs_of(&work);
    let (a, b) = (jobs[0].as_str(), jobs[1].as_str());

    // a -> success, b -> in progress
    h.api.complete(
        a,
        &[success_line("item-0", "zero"), success_line("item-1", "one")],
        &[],
    );
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(work.undone_job_ids, set(&[b]));
    assert_eq!(work.done_job_ids, set(&[a]));
    assert_eq!(runner.output_ids(), vec!["item-0", "item-1"]);

    // b -> success, drains the work
    h.api.complete(
        b,
        &[success_line("item-2", "two")],
        &[error_line("item-3", "rate_limit", "slow down")],
    );
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Completed);
    assert!(work.undone_job_ids.is_empty());
    assert_eq!(work.done_job_ids, set(&[a, b]));

    let outputs = runner.outputs.lock().unwrap().clone();
    let two = outputs.iter().find(|o| o.custom_id == "item-2").unwrap();
    assert_eq!(two.job_id, b);
    assert_eq!(two.status, OutputStatus::Success);
    assert_eq!(two.content.as_deref(), Some("two"));
    let errors = runner.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code.as_deref(), Some("rate_limit"));

    assert!(!h.rescheduler.is_registered(work.id));
    // input + output of a, input + output + error of b
    assert_eq!(h.api.deleted().len(), 5);
}

#[tokio::test]
async fn duplicate_dataset_is_rejected_without_remote_side_effects() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 3);

    let first = h.create(&runner).await;
    let first = h
        .engine
        .drive(first.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let uploads = h.api.uploads();
    let batches = h.api.batch_ids().len();

    let second = h.create(&runner).await;
    let err = h
        .engine
        .drive(second.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap_err();

    match err {
        WorkError::DuplicateDataset { existing, fingerprint } => {
            assert_eq!(existing, first.id);
            assert_eq!(Some(fingerprint), first.dataset_fingerprint);
        }
        other => panic!("expected duplicate dataset, got {other}"),
    }
    let second = h.work(second.id).await;
    assert_eq!(second.status, WorkStatus::Created);
    assert!(second.job_ids().is_empty());
    assert_eq!(h.api.uploads(), uploads);
    assert_eq!(h.api.batch_ids().len(), batches);
    assert!(!h.rescheduler.is_registered(second.id));
}

#[tokio::test]
async fn same_dataset_may_be_resubmitted_when_allowed() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default().allow_same_dataset(true), 2);

    for _ in 0..2 {
        let work = h.create(&runner).await;
        let work = h
            .engine
            .drive(work.id, WorkStatus::Checked, Some(&runner))
            .await
            .unwrap();
        assert_eq!(work.status, WorkStatus::Checked);
        assert!(work.dataset_fingerprint.is_none());
    }
    assert_eq!(h.api.batch_ids().len(), 2);
}

#[tokio::test]
async fn unlisted_job_stays_undone() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();

    h.api.hide(&job);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(work.undone_job_ids, set(&[job.as_str()]));
    assert!(work.done_job_ids.is_empty());
}

#[tokio::test]
async fn unlisted_job_past_completion_window_fails_the_work() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();

    h.dao
        .modify_work(
            work.id,
            mutation(|work| {
                work.submitted_at = Some(Utc::now() - chrono::Duration::days(2));
            }),
        )
        .await
        .unwrap();
    h.api.hide(&job);

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Failed);
    assert_eq!(work.undone_job_ids, set(&[job.as_str()]));
    assert!(!h.rescheduler.is_registered(work.id));
}

#[tokio::test]
async fn transient_listing_failure_waits_for_next_cycle() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();
    h.api.complete(&job, &[success_line("item-0", "zero")], &[]);

    h.api.fail_next_listings(1);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(work.undone_job_ids, set(&[job.as_str()]));

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Completed);
}

#[tokio::test]
async fn broken_result_stream_keeps_job_undone() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 2);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();
    h.api.complete(
        &job,
        &[success_line("item-0", "zero"), success_line("item-1", "one")],
        &[],
    );
    let output = h.api.output_file(&job).unwrap();

    h.api.break_file(&output, true);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(work.undone_job_ids, set(&[job.as_str()]));

    h.api.break_file(&output, false);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Completed);
    assert_eq!(runner.output_ids(), vec!["item-0", "item-1"]);
}

#[tokio::test]
async fn failed_job_routes_its_error_file_to_the_runner() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();

    h.api
        .fail(&job, &[error_line("item-0", "invalid_request", "bad model")]);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Completed);
    assert_eq!(work.done_job_ids, set(&[job.as_str()]));
    let errors = runner.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].job_id, job);
    assert_eq!(errors[0].message.as_deref(), Some("bad model"));
    assert!(runner.outputs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn jobs_are_found_across_listing_pages() {
    let h = Harness::with_options(HarnessOptions {
        page_size: 10,
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 2);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();

    h.api.add_foreign_batches(35);
    h.api.complete(
        &job,
        &[success_line("item-0", "zero"), success_line("item-1", "one")],
        &[],
    );
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Completed);
}

#[tokio::test]
async fn runner_failure_redirects_to_failed_and_still_cleans_up() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1).failing_downloads();
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();
    h.api.complete(&job, &[success_line("item-0", "zero")], &[]);

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Failed);
    assert_eq!(work.undone_job_ids, set(&[job.as_str()]));
    assert!(!h.rescheduler.is_registered(work.id));
    assert_eq!(h.api.deleted().len(), 2);
    // Jobs reached the service, so the dataset stays claimed.
    assert!(work.dataset_fingerprint.is_some());
}

#[tokio::test]
async fn failing_failure_transition_propagates() {
    let h = Harness::with_options(HarnessOptions {
        rescheduler: RecordingRescheduler::failing_unregister(),
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1).failing_downloads();
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let job = h.jobs_of(&work)[0].clone();
    h.api.complete(&job, &[success_line("item-0", "zero")], &[]);

    let err = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkError::Internal(_)));
    assert!(err.report().contains("crontab is not writable"));
    assert_eq!(h.work(work.id).await.status, WorkStatus::Checked);
}

#[tokio::test]
async fn oversized_line_fails_before_anything_is_uploaded() {
    let h = Harness::with_options(HarnessOptions {
        limits: ChunkLimits {
            max_bytes: 32,
            max_lines: 10,
        },
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let work = h.create(&runner).await;

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Failed);
    assert_eq!(h.api.uploads(), 0);
    assert!(work.dataset_fingerprint.is_none());
    assert_eq!(h.rescheduler.events(), vec![CronEvent::Unregistered(work.id)]);
}

#[tokio::test]
async fn invalid_transitions_leave_status_untouched() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 1);
    let created = h.create(&runner).await;

    let err = h
        .engine
        .drive(created.id, WorkStatus::Created, Some(&runner))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkError::InvalidTransition {
            from: WorkStatus::Created,
            to: WorkStatus::Created
        }
    ));
    assert_eq!(h.work(created.id).await.status, WorkStatus::Created);

    let done = h
        .engine
        .drive(created.id, WorkStatus::Completed, Some(&runner))
        .await
        .unwrap();
    assert_eq!(done.status, WorkStatus::Completed);

    for target in WorkStatus::ALL {
        let err = h
            .engine
            .drive(created.id, target, Some(&runner))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkError::InvalidTransition { .. }));
        assert_eq!(h.work(created.id).await.status, WorkStatus::Completed);
    }
}

#[tokio::test]
async fn unknown_work_is_reported() {
    let h = Harness::new().await;
    let id = uuid::Uuid::now_v7();
    let err = h
        .engine
        .drive(id, WorkStatus::Checked, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkError::WorkNotFound(found) if found == id));
}

#[tokio::test]
async fn cancellation_moves_work_to_canceled() {
    let cancel = CancellationToken::new();
    let h = Harness::with_options(HarnessOptions {
        cancel: cancel.clone(),
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 2);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    cancel.cancel();
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Canceled);
    assert!(!h.rescheduler.is_registered(work.id));
}

#[tokio::test]
async fn cancel_arriving_while_polling_is_persisted() {
    let cancel = CancellationToken::new();
    let h = Harness::with_options(HarnessOptions {
        cancel: cancel.clone(),
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 3);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert!(h.rescheduler.is_registered(work.id));

    h.api.cancel_during_listing(&cancel);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Canceled);
    assert_eq!(h.work(work.id).await.status, WorkStatus::Canceled);
    assert!(!h.rescheduler.is_registered(work.id));
}

#[tokio::test]
async fn cancel_arriving_during_retrieval_keeps_collected_job() {
    let cancel = CancellationToken::new();
    let h = Harness::with_options(HarnessOptions {
        cancel: cancel.clone(),
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default().clean_up(false), 3);
    let work = h.create(&runner).await;
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    let jobs = h.jobs_of(&work);
    assert_eq!(jobs.len(), 2);

    h.api.complete(
        &jobs[0],
        &[success_line("item-0", "a"), success_line("item-1", "b")],
        &[],
    );
    h.api.cancel_during_download(&cancel);
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Canceled);
    assert_eq!(work.done_job_ids, set(&[jobs[0].as_str()]));
    assert_eq!(work.undone_job_ids, set(&[jobs[1].as_str()]));
    assert_eq!(runner.output_ids(), vec!["item-0", "item-1"]);
    assert!(!h.rescheduler.is_registered(work.id));
}

#[tokio::test]
async fn cancel_before_submission_uploads_nothing() {
    let cancel = CancellationToken::new();
    let h = Harness::with_options(HarnessOptions {
        cancel: cancel.clone(),
        ..HarnessOptions::default()
    })
    .await;
    let runner = RecordingRunner::new(WorkConfig::default(), 2);
    let work = h.create(&runner).await;

    cancel.cancel();
    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();
    assert_eq!(work.status, WorkStatus::Canceled);
    assert_eq!(h.api.uploads(), 0);
    assert!(work.dataset_fingerprint.is_none());
}

#[tokio::test]
async fn interrupted_submission_resumes_after_recorded_chunks() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(WorkConfig::default(), 5);
    let work = h.create(&runner).await;

    // First chunk went out before the previous process died.
    h.dao
        .modify_work(
            work.id,
            mutation(|work| {
                work.undone_job_ids.insert("batch_earlier".to_string());
                work.submitted_at = Some(Utc::now());
            }),
        )
        .await
        .unwrap();

    let work = h
        .engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(work.status, WorkStatus::Checked);
    assert_eq!(h.api.uploads(), 2, "chunks 1 and 2 of 3");
    assert_eq!(work.undone_job_ids.len(), 3);
    let chunks: Vec<String> = h
        .api
        .requests()
        .iter()
        .map(|r| r.metadata["chunk"].clone())
        .collect();
    assert_eq!(chunks, vec!["1", "2"]);
}

#[tokio::test]
async fn window_parameter_rounds_up_to_hours() {
    let h = Harness::new().await;
    let runner = RecordingRunner::new(
        WorkConfig::default().with_completion_window(Duration::from_secs(90 * 60)),
        1,
    );
    let work = h.create(&runner).await;
    h.engine
        .drive(work.id, WorkStatus::Checked, Some(&runner))
        .await
        .unwrap();

    assert_eq!(h.api.requests()[0].completion_window, "2h");
}
