    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;

    struct Echo(String);

    impl BlockingTask for Echo {
        type Output = String;

        fn label(&self) -> String {
            format!("echo {}", self.0)
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl BlockingHandler<Echo> for EchoHandler {
        async fn handle(&self, req: Echo) -> Result<String, TaskFailure> {
            match req.0.as_str() {
                "boom" => panic!("handler exploded"),
                "fail" => Err(TaskFailure::failed("asked to fail")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(req.0)
                }
                _ => Ok(req.0.to_uppercase()),
            }
        }
    }

    #[test]
    fn test_worker_counters_start_at_zero() {
        let worker = Worker::default();
        assert!(!worker.is_running());
        assert_eq!(worker.tasks_completed(), 0);
        assert_eq!(worker.tasks_failed(), 0);
    }

    #[test]
    fn test_execute_success() {
        let rt = build_runtime().unwrap();
        let result = execute(&rt, &EchoHandler, Echo("abc".into()), &QueueConfig::default());
        assert_eq!(result.unwrap(), "ABC");
    }

    #[test]
    fn test_execute_captures_panic() {
        let rt = build_runtime().unwrap();
        let result = execute(&rt, &EchoHandler, Echo("boom".into()), &QueueConfig::default());
        match result {
            Err(TaskFailure::Panicked { message }) => assert_eq!(message, "handler exploded"),
            other => panic!("expected a panic failure, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_worker_side_timeout() {
        let rt = build_runtime().unwrap();
        let config = QueueConfig {
            task_timeout_secs: 1,
            ..Default::default()
        };
        let result = execute(&rt, &EchoHandler, Echo("slow".into()), &config);
        assert_eq!(result, Err(TaskFailure::TimedOut { after_ms: 1000 }));
    }

    #[test]
    fn test_record_counts_failures() {
        let worker = Worker::default();
        worker.record::<()>(&Ok(()));
        worker.record::<()>(&Err(TaskFailure::failed("x")));
        worker.record::<()>(&Err(TaskFailure::Panicked {
            message: "y".into(),
        }));

        assert_eq!(worker.tasks_completed(), 1);
        assert_eq!(worker.tasks_failed(), 2);
        assert_eq!(worker.tasks_panicked(), 1);

        let stats = WorkerStats::from_worker(&worker, 4);
        assert_eq!(stats.outstanding, 4);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
