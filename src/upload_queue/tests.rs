#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::time::Instant;
    use uuid::Uuid;

    use crate::configuration::types::UploadConfig;
    use crate::error_handling::types::{QueueError, TransportError};
    use crate::transport::{Ack, Transport};
    use crate::upload_queue::{DeliveryOutcome, JobState, QueueEvent, UploadQueue};

    /// Transport whose behaviour is scripted per chunk index.
    #[derive(Default)]
    struct ScriptedTransport {
        calls: Mutex<Vec<(u64, Instant)>>,
        /// Remaining failures per chunk index.
        failures: Mutex<HashMap<u64, u32>>,
        always_fail: AtomicBool,
        never_resolve: bool,
        /// Each call takes `(index + 1) * delay_step_ms`.
        delay_step_ms: u64,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedTransport {
        fn failing_once(index: u64, delay_step_ms: u64) -> Self {
            let t = ScriptedTransport {
                delay_step_ms,
                ..Default::default()
            };
            t.failures.lock().unwrap().insert(index, 1);
            t
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }

        fn call_order(&self) -> Vec<u64> {
            self.calls.lock().unwrap().iter().map(|(i, _)| *i).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn upload(
            &self,
            _session_id: Uuid,
            _payload: Bytes,
            chunk_index: u64,
        ) -> Result<Ack, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((chunk_index, Instant::now()));
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            if self.never_resolve {
                std::future::pending::<()>().await;
            }
            if self.delay_step_ms > 0 {
                tokio::time::sleep(Duration::from_millis((chunk_index + 1) * self.delay_step_ms))
                    .await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.always_fail.load(Ordering::SeqCst) {
                return Err(TransportError::Status {
                    code: 500,
                    body: "internal error".into(),
                });
            }
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&chunk_index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Network("connection reset".into()));
                }
            }
            Ok(Ack::new(chunk_index))
        }
    }

    fn collect_events(queue: &UploadQueue) -> Arc<Mutex<Vec<QueueEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        queue.add_listener(move |event, _| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn succeeded_order(events: &[QueueEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::Succeeded { job, .. } => Some(job.chunk_index),
                _ => None,
            })
            .collect()
    }

    fn config(concurrency: usize, max_retries: u32) -> UploadConfig {
        UploadConfig {
            concurrency,
            max_retries,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_job_backs_off_then_becomes_terminal() {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = Arc::new(ScriptedTransport::default());
        transport.always_fail.store(true, Ordering::SeqCst);
        let queue = UploadQueue::new(
            UploadConfig {
                concurrency: 1,
                max_retries: 3,
                retry_delay_ms: 1000,
                max_retry_delay_ms: 8000,
                ..Default::default()
            },
            transport.clone(),
        );
        let events = collect_events(&queue);
        let session = Uuid::new_v4();

        let id = queue.add_chunk(session, 0, vec![1u8; 16]).unwrap();
        queue.wait_idle().await;

        assert_eq!(transport.call_count(), 4);
        let times = transport.call_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([1000u64, 2000, 4000]) {
            let expected = Duration::from_millis(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(5),
                "gap {:?} expected {:?}",
                gap,
                expected
            );
        }

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::FailedTerminal);
        assert_eq!(job.attempt, 3);
        assert!(job.last_error.unwrap().contains("500"));

        let events = events.lock().unwrap();
        let retryable: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::FailedRetryable { retry_in_ms, .. } => Some(*retry_in_ms),
                _ => None,
            })
            .collect();
        assert_eq!(retryable, vec![1000, 2000, 4000]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, QueueEvent::FailedTerminal { attempt: 3, .. }))
                .count(),
            1
        );
        assert!(events.contains(&QueueEvent::SessionDeliveryFailed { session_id: session }));
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn concurrency_bounds_in_flight_jobs() {
        let transport = Arc::new(ScriptedTransport {
            never_resolve: true,
            ..Default::default()
        });
        let queue = UploadQueue::new(config(3, 3), transport.clone());
        let session = Uuid::new_v4();

        for index in 0..10 {
            queue.add_chunk(session, index, vec![0u8; 8]).unwrap();
        }
        tokio::task::yield_now().await;

        assert_eq!(queue.in_flight_count(), 3);
        assert_eq!(queue.count_in_state(JobState::Queued), 7);
        assert_eq!(transport.call_order(), vec![0, 1, 2]);
        assert!(!queue.is_idle());

        let mut idle = tokio_test::task::spawn(queue.wait_idle());
        tokio_test::assert_pending!(idle.poll());
        queue.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_concurrency() {
        let transport = Arc::new(ScriptedTransport {
            delay_step_ms: 7,
            ..Default::default()
        });
        let queue = UploadQueue::new(config(3, 0), transport.clone());
        let session = Uuid::new_v4();
        for index in 0..10 {
            queue.add_chunk(session, index, vec![0u8; 8]).unwrap();
        }
        queue.wait_idle().await;

        assert_eq!(transport.max_active.load(Ordering::SeqCst), 3);
        assert_eq!(queue.progress().completed_chunks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_with_one_transient_failure() {
        let transport = Arc::new(ScriptedTransport::failing_once(2, 10));
        let queue = UploadQueue::new(config(2, 1), transport.clone());
        let events = collect_events(&queue);
        let session = Uuid::new_v4();

        for index in 0..5 {
            queue.add_chunk(session, index, vec![index as u8 + 1; 100]).unwrap();
        }
        queue.wait_idle().await;

        let events = events.lock().unwrap();
        assert_eq!(succeeded_order(&events), vec![0, 1, 3, 4, 2]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, QueueEvent::FailedTerminal { .. })));

        let progress = queue.progress();
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(progress.failed_chunks, 0);
        assert_eq!(progress.uploaded_bytes, 500);
        assert!(progress.is_complete());
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Delivered);
        assert_eq!(transport.call_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_is_fifo() {
        let transport = Arc::new(ScriptedTransport {
            delay_step_ms: 1,
            ..Default::default()
        });
        let queue = UploadQueue::new(config(1, 0), transport.clone());
        let session = Uuid::new_v4();
        for index in [4, 0, 3, 1, 2] {
            queue.add_chunk(session, index, vec![1u8]).unwrap();
        }
        queue.wait_idle().await;
        assert_eq!(transport.call_order(), vec![4, 0, 3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let transport = Arc::new(ScriptedTransport {
            never_resolve: true,
            ..Default::default()
        });
        let queue = UploadQueue::new(
            UploadConfig {
                concurrency: 1,
                max_retries: 1,
                retry_delay_ms: 100,
                timeout_ms: 250,
                ..Default::default()
            },
            transport.clone(),
        );
        let id = queue.add_chunk(Uuid::new_v4(), 0, vec![1u8]).unwrap();
        queue.wait_idle().await;

        assert_eq!(transport.call_count(), 2);
        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::FailedTerminal);
        assert!(job.last_error.unwrap().contains("timed out after 250ms"));
    }

    #[tokio::test]
    async fn cancel_all_clears_queue() {
        let transport = Arc::new(ScriptedTransport {
            never_resolve: true,
            ..Default::default()
        });
        let queue = UploadQueue::new(config(2, 3), transport.clone());
        let events = collect_events(&queue);
        let session = Uuid::new_v4();
        for index in 0..5 {
            queue.add_chunk(session, index, vec![1u8; 4]).unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(queue.in_flight_count(), 2);

        assert_eq!(queue.cancel_all(), 5);
        assert!(queue.is_idle());
        assert!(queue.jobs().is_empty());
        assert_eq!(queue.progress().total_chunks, 0);
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Unknown);
        assert_eq!(
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, QueueEvent::Cancelled(_)))
                .count(),
            5
        );
        queue.wait_idle().await;
        assert_eq!(queue.cancel_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_resets_attempts() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.always_fail.store(true, Ordering::SeqCst);
        let queue = UploadQueue::new(config(2, 0), transport.clone());
        let session = Uuid::new_v4();
        let a = queue.add_chunk(session, 0, vec![1u8; 3]).unwrap();
        let b = queue.add_chunk(session, 1, vec![2u8; 3]).unwrap();
        queue.wait_idle().await;

        assert_eq!(queue.progress().failed_chunks, 2);
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Failed);

        transport.always_fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.retry_failed(), 2);
        queue.wait_idle().await;

        for id in [a, b] {
            let job = queue.job(id).unwrap();
            assert_eq!(job.state, JobState::Succeeded);
            assert_eq!(job.attempt, 0);
            assert!(job.payload.is_empty());
            assert_eq!(job.size, 3);
        }
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Delivered);
        assert_eq!(queue.retry_failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn any_terminal_failure_can_fail_the_session() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.failures.lock().unwrap().insert(1, 5);
        let queue = UploadQueue::new(
            UploadConfig {
                concurrency: 2,
                max_retries: 0,
                fail_session_on_any_terminal: true,
                ..Default::default()
            },
            transport.clone(),
        );
        let events = collect_events(&queue);
        let session = Uuid::new_v4();
        queue.add_chunk(session, 0, vec![1u8]).unwrap();
        queue.add_chunk(session, 1, vec![1u8]).unwrap();
        queue.wait_idle().await;

        assert_eq!(
            queue.session_outcome(session),
            DeliveryOutcome::PartiallyFailed { failed: 1 }
        );
        assert!(events
            .lock()
            .unwrap()
            .contains(&QueueEvent::SessionDeliveryFailed { session_id: session }));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_does_not_fail_session_by_default() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.failures.lock().unwrap().insert(1, 5);
        let queue = UploadQueue::new(config(2, 0), transport.clone());
        let events = collect_events(&queue);
        let session = Uuid::new_v4();
        queue.add_chunk(session, 0, vec![1u8]).unwrap();
        queue.add_chunk(session, 1, vec![1u8]).unwrap();
        queue.wait_idle().await;

        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::SessionDeliveryFailed { .. })));
        let progress = queue.progress_for(session);
        assert_eq!(progress.completed_chunks, 1);
        assert_eq!(progress.failed_chunks, 1);
        assert_eq!(progress.percentage, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn early_session_failure_is_not_retracted_by_later_chunks() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.failures.lock().unwrap().insert(0, 5);
        let queue = UploadQueue::new(config(1, 0), transport.clone());
        let events = collect_events(&queue);
        let session = Uuid::new_v4();

        queue.add_chunk(session, 0, vec![1u8]).unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.session_outcome(session), DeliveryOutcome::Failed);

        queue.add_chunk(session, 1, vec![2u8]).unwrap();
        queue.wait_idle().await;
        assert_eq!(
            queue.session_outcome(session),
            DeliveryOutcome::PartiallyFailed { failed: 1 }
        );
        let failures = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, QueueEvent::SessionDeliveryFailed { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_listener_does_not_break_scheduling() {
        let transport = Arc::new(ScriptedTransport {
            delay_step_ms: 1,
            ..Default::default()
        });
        let queue = UploadQueue::new(config(2, 0), transport.clone());
        let noisy = queue.add_listener(|event, _| {
            if matches!(event, QueueEvent::Dispatched { .. }) {
                panic!("progress bar exploded");
            }
        });
        let events = collect_events(&queue);
        let session = Uuid::new_v4();
        for index in 0..4 {
            queue.add_chunk(session, index, vec![1u8]).unwrap();
        }
        assert!(queue.remove_listener(noisy));
        queue.wait_idle().await;

        assert_eq!(queue.progress().completed_chunks, 4);
        assert_eq!(succeeded_order(&events.lock().unwrap()).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_chunk_is_delivered_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let queue = UploadQueue::new(config(2, 0), transport.clone());
        let session = Uuid::new_v4();
        let first = queue.add_chunk(session, 0, vec![1u8]).unwrap();
        let second = queue.add_chunk(session, 0, vec![1u8]).unwrap();
        assert_eq!(first, second);
        queue.wait_idle().await;
        assert_eq!(queue.add_chunk(session, 0, vec![1u8]).unwrap(), first);
        queue.wait_idle().await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(queue.progress().total_chunks, 1);
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_payloads() {
        let transport = Arc::new(ScriptedTransport::default());
        let queue = UploadQueue::new(
            UploadConfig {
                max_chunk_bytes: 4,
                ..Default::default()
            },
            transport,
        );
        let session = Uuid::new_v4();
        assert_eq!(
            queue.add_chunk(session, 0, Vec::new()),
            Err(QueueError::EmptyPayload)
        );
        assert_eq!(
            queue.add_chunk(session, 0, vec![0u8; 5]),
            Err(QueueError::PayloadTooLarge { size: 5, max: 4 })
        );
        assert!(queue.is_idle());
        assert!(queue.jobs().is_empty());
    }
}
