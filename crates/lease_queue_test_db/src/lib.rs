#![doc = include_str!("../README.md")]

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_query;
use diesel_migrations::{FileBasedMigrations, MigrationHarness};
use lease_queue_env_vars::{required_var_parsed, var};
use rand::Rng;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

const DATABASE_URL_VAR: &str = "TEST_DATABASE_URL";
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

type ManagementPool = Pool<ConnectionManager<PgConnection>>;

struct TemplateDatabase {
    base_url: Url,
    pool: ManagementPool,
    template_name: String,
    prefix: String,
}

impl TemplateDatabase {
    fn instance() -> &'static Self {
        static INSTANCE: LazyLock<TemplateDatabase> = LazyLock::new(TemplateDatabase::new);
        &INSTANCE
    }

    #[instrument]
    fn new() -> Self {
        let base_url: Url = required_var_parsed(DATABASE_URL_VAR).unwrap();

        let prefix = base_url.path().strip_prefix('/');
        let prefix = prefix.expect("failed to parse database name").to_string();

        let pool = Pool::builder()
            .connection_timeout(CONNECTION_TIMEOUT)
            .max_size(10)
            .min_idle(Some(0))
            .build_unchecked(ConnectionManager::new(base_url.as_ref()));

        let mut conn = pool.get().expect("failed to connect to the database");

        let template_name = format!("{prefix}_template");
        create_template_database(&template_name, &mut conn)
            .expect("failed to create template database");

        let mut template_url = base_url.clone();
        template_url.set_path(&format!("/{template_name}"));

        let mut template_conn = PgConnection::establish(template_url.as_ref())
            .expect("failed to connect to the template database");
        run_migrations(&mut template_conn)
            .expect("failed to run migrations on the template database");

        TemplateDatabase {
            base_url,
            pool,
            template_name,
            prefix,
        }
    }

    fn get_connection(&self) -> PooledConnection<ConnectionManager<PgConnection>> {
        self.pool.get().expect("Failed to get database connection")
    }
}

pub struct TestDatabase {
    name: String,
    url: Url,
    pool: Option<ManagementPool>,
}

impl TestDatabase {
    /// Whether `TEST_DATABASE_URL` is set, i.e. whether [TestDatabase::new]
    /// can succeed at all.
    pub fn is_configured() -> bool {
        matches!(var(DATABASE_URL_VAR), Ok(Some(_)))
    }

    /// Creates a new, fully migrated database from the template. The
    /// database is dropped again when the returned value is dropped.
    #[allow(clippy::new_without_default)]
    #[instrument]
    pub fn new() -> TestDatabase {
        let template = TemplateDatabase::instance();

        let name = format!("{}_{}", template.prefix, generate_name().to_lowercase());

        let mut conn = template.get_connection();
        create_database_from_template(&name, &template.template_name, &mut conn)
            .expect("Failed to create test database");

        let mut url = template.base_url.clone();
        url.set_path(&format!("/{name}"));

        let pool = Pool::builder()
            .connection_timeout(CONNECTION_TIMEOUT)
            .min_idle(Some(0))
            .build_unchecked(ConnectionManager::new(url.as_ref()));

        TestDatabase {
            name,
            url,
            pool: Some(pool),
        }
    }

    pub fn url(&self) -> &str {
        self.url.as_ref()
    }

    /// A synchronous connection for assertions that bypass the queue API.
    pub fn connect(&self) -> PooledConnection<ConnectionManager<PgConnection>> {
        self.pool
            .as_ref()
            .unwrap()
            .get()
            .expect("Failed to get database connection")
    }
}

impl Drop for TestDatabase {
    #[instrument(skip(self))]
    fn drop(&mut self) {
        // All connections to the database have to be gone before it can be
        // dropped.
        self.pool = None;

        let mut conn = TemplateDatabase::instance().get_connection();
        drop_database(&self.name, &mut conn).expect("failed to drop test database");
    }
}

#[instrument(skip(conn))]
fn create_template_database(name: &str, conn: &mut PgConnection) -> QueryResult<()> {
    table! {
        pg_database (datname) {
            datname -> Text,
        }
    }

    let count: i64 = pg_database::table
        .count()
        .filter(pg_database::datname.eq(name))
        .get_result(conn)?;

    if count == 0 {
        debug!("Creating template database…");
        sql_query(format!("CREATE DATABASE {name}")).execute(conn)?;
    }

    Ok(())
}

#[instrument(skip(conn))]
fn create_database_from_template(
    name: &str,
    template_name: &str,
    conn: &mut PgConnection,
) -> QueryResult<()> {
    debug!("Creating new test database from template…");
    sql_query(format!("CREATE DATABASE {name} TEMPLATE {template_name}")).execute(conn)?;
    Ok(())
}

#[instrument(skip(conn))]
fn drop_database(name: &str, conn: &mut PgConnection) -> QueryResult<()> {
    debug!("Dropping database…");
    sql_query(format!("DROP DATABASE {name} WITH (FORCE)")).execute(conn)?;
    Ok(())
}

#[instrument(skip(conn))]
fn run_migrations(conn: &mut PgConnection) -> diesel::migration::Result<()> {
    debug!("Running pending database migrations…");
    let migrations = FileBasedMigrations::find_migrations_directory()?;
    conn.run_pending_migrations(migrations)?;
    Ok(())
}

fn generate_name() -> String {
    let mut rng = rand::rng();
    std::iter::repeat(())
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .take(16)
        .collect()
}
