//! Role, database, and privilege convergence.
//!
//! Existence is checked before creating; mutable settings are re-applied
//! unconditionally. The password in particular is ALTERed on every run even
//! when the role was just created, so a drifted credential from an earlier
//! run converges back to the desired one.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::{
    config::Config,
    control::{CatalogKind, MAINTENANCE_DB, QueryRunner},
    error::{BootstrapError, BootstrapResult},
};

/// Quote a SQL identifier (role or database name).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Converges one (role, password, database) triple plus its grants.
pub struct IdentityConverger<'a> {
    role: &'a str,
    password: &'a str,
    database: &'a str,
}

impl<'a> IdentityConverger<'a> {
    pub fn new(role: &'a str, password: &'a str, database: &'a str) -> Self {
        Self {
            role,
            password,
            database,
        }
    }

    pub fn from_config(config: &'a Config) -> Self {
        Self::new(&config.user, &config.password, &config.database)
    }

    /// Safe under repeated invocation against the same running instance; the
    /// engine's transactional guarantees serialize concurrent DDL.
    ///
    /// Grants cover objects existing at convergence time. Objects created
    /// between runs by other writers are only picked up on the next pass —
    /// an eventual-consistency gap, accepted by design.
    pub async fn converge<Q>(&self, query: &Q) -> BootstrapResult<()>
    where
        Q: QueryRunner + ?Sized,
    {
        self.apply(query)
            .await
            .map_err(|err| BootstrapError::identity(format!("{err:#}")))
    }

    async fn apply<Q>(&self, query: &Q) -> Result<()>
    where
        Q: QueryRunner + ?Sized,
    {
        let role = quote_ident(self.role);
        let password = quote_literal(self.password);
        let database = quote_ident(self.database);

        let role_exists = query
            .exists(CatalogKind::Role, self.role)
            .await
            .context("check role existence")?;
        if role_exists {
            debug!(role = self.role, "role already exists");
        } else {
            info!(role = self.role, "creating role");
            query
                .execute(
                    MAINTENANCE_DB,
                    &format!("CREATE ROLE {role} LOGIN PASSWORD {password}"),
                )
                .await
                .context("create role")?;
        }

        // Always re-applied, created-just-now or not: password convergence.
        query
            .execute(
                MAINTENANCE_DB,
                &format!("ALTER ROLE {role} WITH LOGIN PASSWORD {password}"),
            )
            .await
            .context("apply role password")?;

        let db_exists = query
            .exists(CatalogKind::Database, self.database)
            .await
            .context("check database existence")?;
        if db_exists {
            debug!(database = self.database, "database already exists");
        } else {
            info!(database = self.database, role = self.role, "creating database");
            query
                .execute(
                    MAINTENANCE_DB,
                    &format!("CREATE DATABASE {database} OWNER {role}"),
                )
                .await
                .context("create database")?;
        }

        for (target_db, statement) in self.grant_statements() {
            query
                .execute(&target_db, &statement)
                .await
                .context("apply grants")?;
        }

        Ok(())
    }

    /// The full battery, re-applied every run. Schema-level statements must
    /// execute inside the target database; the database-level grant runs from
    /// the maintenance database.
    fn grant_statements(&self) -> Vec<(String, String)> {
        let role = quote_ident(self.role);
        let database = quote_ident(self.database);
        let target = self.database.to_string();

        let mut statements = vec![(
            MAINTENANCE_DB.to_string(),
            format!("GRANT ALL PRIVILEGES ON DATABASE {database} TO {role}"),
        )];
        for sql in [
            format!("GRANT USAGE, CREATE ON SCHEMA public TO {role}"),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TABLES TO {role}"),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON SEQUENCES TO {role}"),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON FUNCTIONS TO {role}"),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TYPES TO {role}"),
            format!("GRANT ALL ON ALL TABLES IN SCHEMA public TO {role}"),
            format!("GRANT ALL ON ALL SEQUENCES IN SCHEMA public TO {role}"),
            format!("GRANT ALL ON ALL FUNCTIONS IN SCHEMA public TO {role}"),
        ] {
            statements.push((target.clone(), sql));
        }
        statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Records every statement; existence answers are pre-seeded.
    struct RecordingRunner {
        role_exists: bool,
        db_exists: bool,
        executed: Mutex<Vec<(String, String)>>,
    }

    impl RecordingRunner {
        fn new(role_exists: bool, db_exists: bool) -> Self {
            Self {
                role_exists,
                db_exists,
                executed: Mutex::new(Vec::new()),
            }
        }

        fn statements(&self) -> Vec<(String, String)> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryRunner for RecordingRunner {
        async fn exists(&self, kind: CatalogKind, _name: &str) -> Result<bool> {
            Ok(match kind {
                CatalogKind::Role => self.role_exists,
                CatalogKind::Database => self.db_exists,
            })
        }

        async fn execute(&self, database: &str, statement: &str) -> Result<()> {
            self.executed
                .lock()
                .unwrap()
                .push((database.to_string(), statement.to_string()));
            Ok(())
        }
    }

    fn converger() -> IdentityConverger<'static> {
        IdentityConverger::new("tester", "pw2", "testdb")
    }

    #[tokio::test]
    async fn creates_role_and_database_when_absent() {
        let runner = RecordingRunner::new(false, false);
        converger().converge(&runner).await.unwrap();

        let statements = runner.statements();
        assert_eq!(
            statements[0].1,
            "CREATE ROLE \"tester\" LOGIN PASSWORD 'pw2'"
        );
        assert!(statements
            .iter()
            .any(|(_, sql)| sql == "CREATE DATABASE \"testdb\" OWNER \"tester\""));
    }

    #[tokio::test]
    async fn password_is_reapplied_even_when_role_exists() {
        let runner = RecordingRunner::new(true, true);
        converger().converge(&runner).await.unwrap();

        let statements = runner.statements();
        assert!(!statements.iter().any(|(_, sql)| sql.starts_with("CREATE")));
        assert!(statements
            .iter()
            .any(|(_, sql)| sql == "ALTER ROLE \"tester\" WITH LOGIN PASSWORD 'pw2'"));
    }

    #[tokio::test]
    async fn grants_run_every_time_against_the_target_database() {
        let runner = RecordingRunner::new(true, true);
        converger().converge(&runner).await.unwrap();

        let statements = runner.statements();
        let schema_grants: Vec<_> = statements
            .iter()
            .filter(|(db, sql)| db == "testdb" && sql.contains("public"))
            .collect();
        // usage/create + 4 default-privilege templates + 3 existing-object grants
        assert_eq!(schema_grants.len(), 8);
        assert!(statements
            .iter()
            .any(|(db, sql)| db == "postgres"
                && sql == "GRANT ALL PRIVILEGES ON DATABASE \"testdb\" TO \"tester\""));
    }

    #[test]
    fn quoting_escapes_embedded_delimiters() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
