#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs, sync::Arc};
    use tessera::{
        Engine, Entity, EntityModel, ErrorKind, FixedClock, Result, Value, error_kind,
    };
    use tessera_tests::{MockDriver, Person, init_logs, mock_config, silent_logs};
    use time::macros::datetime;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Event {
        id: Option<i64>,
        payload: String,
    }

    impl Entity for Event {
        fn model() -> Result<EntityModel<Self>> {
            EntityModel::<Self>::builder("Event", "event")
                .identity("id", "id", |e: &Event| e.id, |e, v| e.id = v)
                .field("payload", "payload", |e: &Event| e.payload.clone(), |e, v| e.payload = v)
                .batch_size(100)
                .build()
        }
    }

    fn person(name: &str, last_name: &str, age: i32) -> Person {
        Person {
            id: None,
            name: name.into(),
            last_name: last_name.into(),
            age,
        }
    }

    fn inserts(driver: &MockDriver) -> Vec<String> {
        driver
            .sql()
            .into_iter()
            .filter(|sql| sql.starts_with("INSERT"))
            .collect()
    }

    async fn engine(driver: &MockDriver, test: &str) -> Engine<MockDriver> {
        init_logs();
        let engine = Engine::connect(driver.clone(), mock_config(test))
            .await
            .expect("Could not connect to the mock store");
        engine.register::<Person>().unwrap();
        engine.register::<Event>().unwrap();
        engine
    }

    #[tokio::test]
    async fn threshold_triggers_one_multi_row_insert() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "threshold").await;
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        engine.save(person("Alan", "Turing", 41)).await.unwrap();
        assert!(inserts(&driver).is_empty());
        engine.save(person("Grace", "Hopper", 85)).await.unwrap();
        let inserts = inserts(&driver);
        assert_eq!(inserts.len(), 1);
        assert_eq!(
            inserts[0],
            "INSERT INTO person (id, name, last_name, age) VALUES (?, ?, ?, ?), (?, ?, ?, ?), (?, ?, ?, ?)"
        );
        let query = driver.queries().pop().unwrap();
        assert_eq!(query.params.len(), 12);
        assert_eq!(query.params[1], Value::from("Ada"));
        assert_eq!(query.params[9], Value::from("Grace"));
        assert_eq!(engine.batch_stats().flushes(), 1);
        assert_eq!(engine.batch_stats().rows_flushed(), 3);
    }

    #[tokio::test]
    async fn reads_see_pending_writes() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "read-your-writes").await;
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        engine.save(person("Alan", "Turing", 41)).await.unwrap();
        engine.find_all::<Person>().await.unwrap();
        let sql = driver.sql();
        assert_eq!(sql.len(), 2);
        assert!(sql[0].starts_with("INSERT INTO person"));
        assert_eq!(sql[0].matches('(').count(), 3);
        assert_eq!(sql[1], "SELECT id, name, last_name, age FROM person");
    }

    #[tokio::test]
    async fn exhausted_batch_is_spilled() {
        init_logs();
        let driver = MockDriver::new();
        let config = mock_config("exhausted");
        let _ = fs::remove_dir_all(&config.spill_directory);
        let directory = config.spill_directory.clone();
        let engine = Engine::builder(driver.clone(), config)
            .clock(Arc::new(FixedClock(datetime!(2024-01-01 12:00:00))))
            .connect()
            .await
            .unwrap();
        engine.register::<Person>().unwrap();
        engine.save(person("Doe, John", "Smith", 30)).await.unwrap();
        engine.save(person("Jane", "Roe", 28)).await.unwrap();
        driver.fail_executions(3);
        silent_logs! {
            let error = engine
                .save(person("Said \"Bob\"", "Jones", 52))
                .await
                .expect_err("Every attempt fails");
            assert_eq!(error_kind(&error), Some(ErrorKind::Batch));
        };
        assert_eq!(inserts(&driver).len(), 3);
        let content = fs::read_to_string(directory.join("person_20240101_120000.csv"))
            .expect("Spill file not written");
        assert_eq!(
            content,
            "1,\"Doe, John\",Smith,30\n2,Jane,Roe,28\n3,\"Said \"\"Bob\"\"\",Jones,52\n"
        );
        assert_eq!(engine.batch_stats().failed_batches(), 1);
        assert_eq!(engine.batch_stats().retries(), 2);
        // Rows are gone, the next save starts a new batch
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        assert_eq!(inserts(&driver).len(), 3);
        let _ = fs::remove_dir_all(&directory);
    }

    #[tokio::test]
    async fn retried_batch_is_not_spilled() {
        let driver = MockDriver::new();
        let config = mock_config("retried");
        let _ = fs::remove_dir_all(&config.spill_directory);
        let directory = config.spill_directory.clone();
        init_logs();
        let engine = Engine::connect(driver.clone(), config).await.unwrap();
        engine.register::<Person>().unwrap();
        driver.fail_executions(2);
        silent_logs! {
            for i in 0..3 {
                engine.save(person("Ada", "Lovelace", i)).await.unwrap();
            }
        };
        assert_eq!(inserts(&driver).len(), 3);
        assert_eq!(engine.batch_stats().flushes(), 1);
        assert_eq!(engine.batch_stats().retries(), 2);
        assert!(!directory.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_fill_whole_batches() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "concurrent-saves").await;
        let tasks = (0..8)
            .map(|t| {
                let engine = engine.clone();
                let count = if t < 4 { 63 } else { 62 };
                tokio::spawn(async move {
                    for i in 0..count {
                        engine
                            .save(Event {
                                id: None,
                                payload: format!("{}-{}", t, i),
                            })
                            .await
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        let queries = driver
            .queries()
            .into_iter()
            .filter(|q| q.sql.starts_with("INSERT"))
            .collect::<Vec<_>>();
        assert_eq!(queries.len(), 5);
        let mut ids = BTreeSet::new();
        for query in &queries {
            assert_eq!(query.params.len(), 200);
            for id in query.params.iter().step_by(2) {
                let Value::Int64(Some(id)) = id else {
                    panic!("Unexpected identifier {:?}", id);
                };
                ids.insert(*id);
            }
        }
        assert_eq!(ids.len(), 500);
        assert_eq!(engine.batch_stats().rows_flushed(), 500);
    }

    #[tokio::test]
    async fn save_batch_forces_a_flush() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "save-batch").await;
        engine.save_batch::<Person>().await.unwrap();
        assert!(inserts(&driver).is_empty());
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        engine.save_batch::<Person>().await.unwrap();
        assert_eq!(
            inserts(&driver),
            ["INSERT INTO person (id, name, last_name, age) VALUES (?, ?, ?, ?)"]
        );
        assert_eq!(engine.batch_stats().rows_flushed(), 1);
    }

    #[tokio::test]
    async fn flush_all_covers_every_entity() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "flush-all").await;
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        engine
            .save(Event {
                id: None,
                payload: "started".into(),
            })
            .await
            .unwrap();
        engine.flush_all().await.unwrap();
        let mut inserts = inserts(&driver);
        inserts.sort();
        assert_eq!(
            inserts,
            [
                "INSERT INTO event (id, payload) VALUES (?, ?)",
                "INSERT INTO person (id, name, last_name, age) VALUES (?, ?, ?, ?)",
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_rows() {
        let driver = MockDriver::new();
        let engine = engine(&driver, "shutdown-flush").await;
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        engine.save(person("Alan", "Turing", 41)).await.unwrap();
        engine.shutdown().await.unwrap();
        let inserts = inserts(&driver);
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].matches('(').count(), 3);
        assert_eq!(engine.pool_stats().idle, 0);
        silent_logs! {
            let error = engine.count::<Person>().await.expect_err("The pool is closed");
            assert_eq!(error_kind(&error), Some(ErrorKind::Resource));
        };
    }

    #[tokio::test]
    async fn timer_flushes_in_the_background() {
        init_logs();
        let driver = MockDriver::new();
        let mut config = mock_config("timer-flush");
        config.batch_flush_interval = std::time::Duration::from_millis(20);
        let engine = Engine::connect(driver.clone(), config).await.unwrap();
        engine.register::<Person>().unwrap();
        engine.save(person("Ada", "Lovelace", 36)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(inserts(&driver).len(), 1);
        engine.shutdown().await.unwrap();
        assert_eq!(inserts(&driver).len(), 1);
    }
}
