#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};
    use tessera::{
        Config, ConnectionPool, Engine, EngineError, ErrorKind, PoolStats, error_kind,
    };
    use tessera_tests::{MockDriver, init_logs, mock_config, silent_logs};
    use tokio::{sync::watch, time::sleep};

    fn config(test: &str, initial: usize, max: usize) -> Config {
        Config {
            initial_pool_size: initial,
            min_pool_size: 1,
            max_pool_size: max,
            refill_threshold: 0,
            ..mock_config(test)
        }
    }

    async fn started(driver: &MockDriver, config: Config) -> Arc<ConnectionPool<MockDriver>> {
        init_logs();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(driver.clone()),
            Arc::new(config),
        ));
        let (_sender, receiver) = watch::channel(false);
        pool.start(receiver).await.expect("Pool did not start");
        pool
    }

    #[tokio::test]
    async fn health_gate_waits_for_the_store() {
        init_logs();
        let driver = MockDriver::new();
        driver.fail_pings(3);
        silent_logs! {
            let engine = Engine::connect(driver.clone(), mock_config("health-gate"))
                .await
                .unwrap();
            assert_eq!(driver.pings(), 4);
            assert_eq!(driver.opened(), 4);
            assert_eq!(engine.pool_stats().idle, 4);
        };
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_health_gate() {
        init_logs();
        let driver = MockDriver::new();
        driver.fail_pings(usize::MAX);
        let pool = ConnectionPool::new(
            Arc::new(driver.clone()),
            Arc::new(mock_config("health-gate-shutdown")),
        );
        let (sender, receiver) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            sender.send_replace(true);
        });
        silent_logs! {
            let error = pool.start(receiver).await.expect_err("Shutdown was requested");
            assert_eq!(error_kind(&error), Some(ErrorKind::Resource));
        };
        assert!(driver.pings() > 1);
        assert_eq!(driver.opened(), 0);
    }

    #[tokio::test]
    async fn initial_fill() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("initial-fill", 3, 8)).await;
        assert_eq!(driver.opened(), 3);
        assert_eq!(
            pool.stats(),
            PoolStats {
                idle: 3,
                outstanding: 0,
                pending: 0,
                target_size: 3,
            }
        );
    }

    #[tokio::test]
    async fn release_closes_the_connection() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("release-closes", 2, 4)).await;
        let connection = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(pool.stats().idle, 1);
        pool.release(connection).await;
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn empty_pool_opens_and_expands() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("expansion", 2, 8)).await;
        let mut connections = Vec::new();
        for _ in 0..3 {
            connections.push(pool.acquire().await.unwrap());
        }
        assert_eq!(driver.opened(), 3);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 3);
        assert_eq!(stats.target_size, 4);
        for connection in connections {
            pool.release(connection).await;
        }
    }

    #[tokio::test]
    async fn expansion_disabled_keeps_the_target() {
        let driver = MockDriver::new();
        let pool = started(
            &driver,
            Config {
                expansion_allowed: false,
                ..config("no-expansion", 1, 4)
            },
        )
        .await;
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().target_size, 1);
        pool.release(first).await;
        pool.release(second).await;
    }

    #[tokio::test]
    async fn expansion_is_capped() {
        let driver = MockDriver::new();
        let pool = started(
            &driver,
            Config {
                expansion_step: 10,
                ..config("expansion-cap", 1, 3)
            },
        )
        .await;
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().target_size, 3);
        pool.release(first).await;
        pool.release(second).await;
    }

    #[tokio::test]
    async fn refill_tops_up_below_the_threshold() {
        let driver = MockDriver::new();
        let pool = started(
            &driver,
            Config {
                refill_threshold: 2,
                ..config("refill", 2, 4)
            },
        )
        .await;
        let connection = pool.acquire().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        // Target is 2 and one connection is out: the refill has nothing to open
        assert_eq!(driver.opened(), 2);
        pool.release(connection).await;
        let connection = pool.acquire().await.unwrap();
        for _ in 0..100 {
            if pool.stats().idle == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats().total(), 2);
        assert_eq!(driver.opened(), 3);
        pool.release(connection).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_never_exceeds_its_maximum() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("bounded", 2, 4)).await;
        let tasks = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        let connection = pool.acquire().await.unwrap();
                        assert!(pool.stats().total() <= 4);
                        sleep(Duration::from_millis(1)).await;
                        pool.release(connection).await;
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.stats().total() <= 4);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(driver.closed(), 160);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_a_release() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("woken", 1, 1)).await;
        let connection = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let connection = pool.acquire().await?;
                pool.release(connection).await;
                tessera::Result::Ok(())
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        pool.release(connection).await;
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_frees_its_slot() {
        let driver = MockDriver::new();
        let pool = started(
            &driver,
            Config {
                acquire_timeout: Duration::from_millis(200),
                ..config("dropped-connection", 1, 1)
            },
        )
        .await;
        let connection = pool.acquire().await.unwrap();
        drop(connection);
        let connection = pool.acquire().await.expect("The slot was given back");
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.stats().outstanding, 1);
        pool.release(connection).await;
        assert_eq!(pool.stats().total(), 0);
    }

    #[tokio::test]
    async fn close_all_wakes_waiters() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("close-all-waiter", 1, 1)).await;
        let connection = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        pool.close_all_connections().await;
        let error = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("The waiter was not woken")
            .unwrap()
            .expect_err("The pool is closed");
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::PoolClosed)
        ));
        pool.release(connection).await;
    }

    #[tokio::test]
    async fn acquire_times_out_at_capacity() {
        let driver = MockDriver::new();
        let pool = started(
            &driver,
            Config {
                acquire_timeout: Duration::from_millis(50),
                ..config("acquire-timeout", 1, 1)
            },
        )
        .await;
        let connection = pool.acquire().await.unwrap();
        silent_logs! {
            let error = pool.acquire().await.expect_err("The pool is exhausted");
            assert!(matches!(
                error.downcast_ref::<EngineError>(),
                Some(EngineError::AcquireTimeout(..))
            ));
            assert_eq!(error_kind(&error), Some(ErrorKind::Resource));
        };
        pool.release(connection).await;
    }

    #[tokio::test]
    async fn failed_connect_is_a_connectivity_error() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("connect-failure", 1, 4)).await;
        let connection = pool.acquire().await.unwrap();
        driver.fail_connects(1);
        silent_logs! {
            let error = pool.acquire().await.expect_err("Connect refused");
            assert!(matches!(
                error.downcast_ref::<EngineError>(),
                Some(EngineError::Connectivity { .. })
            ));
            assert_eq!(error_kind(&error), Some(ErrorKind::Resource));
        };
        // The reserved slot was given back
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.stats().outstanding, 1);
        let second = pool.acquire().await.unwrap();
        pool.release(connection).await;
        pool.release(second).await;
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("close-all", 3, 4)).await;
        pool.close_all_connections().await;
        assert_eq!(driver.closed(), 3);
        pool.close_all_connections().await;
        assert_eq!(driver.closed(), 3);
        assert_eq!(pool.stats().idle, 0);
        silent_logs! {
            let error = pool.acquire().await.expect_err("The pool is closed");
            assert!(matches!(
                error.downcast_ref::<EngineError>(),
                Some(EngineError::PoolClosed)
            ));
        };
    }

    #[tokio::test]
    async fn reconfigure_swaps_the_endpoint() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("reconfigure", 2, 4)).await;
        let (_sender, receiver) = watch::channel(false);
        let updated = Config {
            url: "mock://replica/reconfigure".into(),
            ..config("reconfigure", 2, 4)
        };
        pool.reconfigure(Arc::new(updated), receiver).await.unwrap();
        assert_eq!(pool.config().url, "mock://replica/reconfigure");
        assert_eq!(driver.closed(), 2);
        for _ in 0..100 {
            if pool.stats().idle == 2 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(driver.opened(), 4);
    }

    #[tokio::test]
    async fn refill_in_flight_does_not_outlive_a_reconfiguration() {
        let driver = MockDriver::new();
        let settings = |url: &str| Config {
            url: url.into(),
            refill_threshold: 2,
            expansion_allowed: false,
            ..config("reconfigure-refill", 2, 4)
        };
        let old = "mock://localhost/reconfigure-refill";
        let new = "mock://replica/reconfigure-refill";
        let pool = started(&driver, settings(old)).await;
        let first = pool.acquire().await.unwrap();
        pool.release(first).await;
        driver.delay_connects(Duration::from_millis(100));
        // Leaves the pool empty, the refill starts opening a connection to the old endpoint
        let second = pool.acquire().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        let (_sender, receiver) = watch::channel(false);
        pool.reconfigure(Arc::new(settings(new)), receiver)
            .await
            .unwrap();
        pool.release(second).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(driver.endpoints(), [old, old, old]);
        let connection = pool.acquire().await.unwrap();
        assert_eq!(connection.endpoint(), new);
        let endpoints = driver.endpoints();
        assert!(endpoints[3..].iter().all(|url| url == new));
        pool.release(connection).await;
    }

    #[tokio::test]
    async fn invalid_reconfiguration_keeps_the_current_settings() {
        let driver = MockDriver::new();
        let pool = started(&driver, config("bad-reconfigure", 2, 4)).await;
        let (_sender, receiver) = watch::channel(false);
        let invalid = Config {
            max_pool_size: 1,
            ..config("bad-reconfigure", 2, 4)
        };
        assert!(pool.reconfigure(Arc::new(invalid), receiver).await.is_err());
        assert_eq!(pool.config().max_pool_size, 4);
        assert_eq!(driver.closed(), 0);
    }
}
