//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test. Each test gets its own
//! freshly migrated database inside it, so agent rosters never leak between
//! tests running in parallel.

use anyhow::{Context, Result};
use outbox_coordination::PgStore;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    server_url: String,
    admin_pool: PgPool,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=outbox_coordination=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        let admin_pool = PgPool::connect(&format!("{}/postgres", server_url))
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self {
            server_url,
            admin_pool,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test context: a migrated, empty database and a store over it.
///
/// ```ignore
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let mut tx = ctx.store.begin_outbox().await.unwrap();
///     // ...
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub store: PgStore,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let database = format!("coordination_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE {}", database))
            .execute(&infra.admin_pool)
            .await
            .context("Failed to create test database")?;

        let db_pool = PgPool::connect(&format!("{}/{}", infra.server_url, database))
            .await
            .context("Failed to connect to test database")?;

        let store = PgStore::new(db_pool.clone());
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self { db_pool, store })
    }
}
